//! Host ops exposed to the guest bootstrap.
//!
//! The bootstrap captures these from `Deno.core.ops` before pruning the
//! global object; guest code never sees them directly.

use crate::protocol::GuestMessage;
use anyhow::{anyhow, Error};
use deno_core::{op2, OpState};
use std::time::Duration;

/// Reply posted by the dispatch function, waiting to be collected.
pub struct PostedReply(pub GuestMessage);

/// Global names the bootstrap could neither trap nor remove.
pub struct UnenforcedNames(pub Vec<String>);

/// Guest timers still scheduled when the last reply was posted.
pub struct PendingTimers(pub u32);

/// Longest delay a guest timer may request.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Protocol Ops
// ============================================================================

#[op2(fast)]
pub fn op_initminal_post_message(state: &mut OpState, #[string] json: &str) {
    state.put(PostedReply(GuestMessage::from_json(json)));
}

#[op2]
pub fn op_initminal_report_unenforced(state: &mut OpState, #[serde] names: Vec<String>) {
    state.put(UnenforcedNames(names));
}

#[op2(fast)]
pub fn op_initminal_report_timers(state: &mut OpState, count: u32) {
    state.put(PendingTimers(count));
}

// ============================================================================
// Console Ops
// ============================================================================

#[op2(fast)]
pub fn op_initminal_console(#[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "initminal::guest", "{}", msg),
        "warn" => tracing::warn!(target: "initminal::guest", "{}", msg),
        "debug" => tracing::debug!(target: "initminal::guest", "{}", msg),
        _ => tracing::info!(target: "initminal::guest", "{}", msg),
    }
}

// ============================================================================
// Timer Ops
// ============================================================================

#[op2(async)]
pub async fn op_initminal_sleep(millis: f64) {
    tokio::time::sleep(timer_delay(millis)).await;
}

fn timer_delay(millis: f64) -> Duration {
    if !millis.is_finite() || millis <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(millis / 1000.0).min(MAX_TIMER_DELAY)
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_initminal_btoa(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    // btoa expects Latin-1, but we'll be lenient and accept UTF-8
    Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
}

#[op2]
#[string]
pub fn op_initminal_atob(#[string] data: &str) -> Result<String, Error> {
    use base64::Engine;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow!("Invalid base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in decoded data: {}", e))
}

// ============================================================================
// Crypto Ops
// ============================================================================

#[op2]
#[string]
pub fn op_initminal_random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[op2(fast)]
pub fn op_initminal_get_random_values(#[buffer] buf: &mut [u8]) {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(buf);
}

#[op2]
#[buffer]
pub fn op_initminal_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, Error> {
    digest(algorithm, data)
}

fn digest(algorithm: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    let result = match algorithm.to_uppercase().replace('-', "").as_str() {
        "SHA256" => Sha256::digest(data).to_vec(),
        "SHA384" => Sha384::digest(data).to_vec(),
        "SHA512" => Sha512::digest(data).to_vec(),
        _ => {
            return Err(anyhow!(
                "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
                algorithm
            ))
        }
    };

    Ok(result)
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    initminal_runtime,
    ops = [
        op_initminal_post_message,
        op_initminal_report_unenforced,
        op_initminal_report_timers,
        op_initminal_console,
        op_initminal_sleep,
        op_initminal_btoa,
        op_initminal_atob,
        op_initminal_random_uuid,
        op_initminal_get_random_values,
        op_initminal_digest,
    ],
);
