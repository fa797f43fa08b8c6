//! # initminal-run
//!
//! Evaluate short, untrusted ES modules in an isolated V8 context using
//! deno_core.
//!
//! ## Security Guarantees
//!
//! - **Whitelisted globals only**: any global name outside the whitelist
//!   throws `Security Exception: cannot access: <name>` when read
//! - **No module access**: only dependencies the caller mapped can be imported
//! - **No network access from guest code**: `http(s)` dependencies are fetched
//!   by the host before execution and inlined
//! - **No filesystem or environment access**: `Deno` and its ops are unreachable
//! - **Always killable**: a job that overruns its timeout has its isolate
//!   terminated and discarded
//!
//! ## Usage
//!
//! ```rust,ignore
//! use initminal_run::{create_sandbox, Job, SandboxConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sandbox = create_sandbox(SandboxConfig::default()).unwrap();
//!
//!     let result = sandbox
//!         .run(Job::new("export const initminal = (n) => n * 2;").arg(21.into()))
//!         .await;
//!
//!     println!("{}", serde_json::to_string(&result).unwrap());
//! }
//! ```

mod capability;
mod config;
mod context;
mod encoding;
mod error;
mod fetch;
mod loader;
mod ops;
mod protocol;
mod queue;
pub mod resolver;
mod result;
mod sandbox;

pub use capability::{default_safe_objects, CapabilityTable, HostCapability, Whitelist, MIN_SAFE_OBJECTS};
pub use config::{SandboxConfig, DEFAULT_TIMEOUT};
pub use context::{ContextStatus, Teardown};
pub use encoding::{BlobStore, EncodingStrategy};
pub use error::{ErrorPayload, EvalError, GuestError, SECURITY_EXCEPTION_PREFIX};
pub use fetch::{FetchConfig, HttpFetcher, ModuleFetcher, StaticFetcher};
pub use loader::GuestModuleLoader;
pub use queue::{Job, DEFAULT_CALL_TARGET};
pub use resolver::Dependencies;
pub use result::EvalResult;
pub use sandbox::Sandbox;

/// Create a sandbox instance. See [`Sandbox::new`].
pub fn create_sandbox(config: SandboxConfig) -> anyhow::Result<Sandbox> {
    Sandbox::new(config)
}
