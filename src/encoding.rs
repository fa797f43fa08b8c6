//! Turning inline module source into a location the guest loader accepts.
//!
//! Two strategies are available:
//!
//! - [`EncodingStrategy::InlineDataUri`] embeds the source in a base64
//!   `data:text/javascript` URI. Nothing needs cleaning up.
//! - [`EncodingStrategy::EphemeralBlobUri`] registers the source in a
//!   [`BlobStore`] under a fresh `blob:initminal/<uuid>` URL. The URL lives
//!   only as long as the [`EncodingSession`] that issued it.

use anyhow::{anyhow, Result};
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

const DATA_URI_PREFIX: &str = "data:text/javascript;base64,";
const BLOB_URL_PREFIX: &str = "blob:initminal/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingStrategy {
    #[default]
    InlineDataUri,
    EphemeralBlobUri,
}

impl fmt::Display for EncodingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingStrategy::InlineDataUri => f.write_str("data-uri"),
            EncodingStrategy::EphemeralBlobUri => f.write_str("blob-uri"),
        }
    }
}

impl FromStr for EncodingStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data-uri" | "inline-data-uri" | "utf-8" => Ok(EncodingStrategy::InlineDataUri),
            "blob-uri" | "ephemeral-blob-uri" | "blob" => Ok(EncodingStrategy::EphemeralBlobUri),
            other => Err(anyhow!(
                "Unknown encoding '{}'. Expected 'data-uri' or 'blob-uri'",
                other
            )),
        }
    }
}

/// In-memory module sources addressed by `blob:` URL.
///
/// Shared between the job runner (which registers and revokes) and every
/// context's module loader (which reads).
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    entries: Arc<Mutex<HashMap<String, Arc<str>>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<str>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `source` and return its freshly minted URL.
    pub fn register(&self, source: &str) -> String {
        let url = format!("{}{}", BLOB_URL_PREFIX, uuid::Uuid::new_v4());
        self.lock().insert(url.clone(), Arc::from(source));
        url
    }

    pub fn get(&self, url: &str) -> Option<Arc<str>> {
        self.lock().get(url).cloned()
    }

    pub fn revoke(&self, url: &str) -> bool {
        self.lock().remove(url).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encodes the sources of one job. Blob URLs it issued are revoked on drop.
pub struct EncodingSession {
    strategy: EncodingStrategy,
    blobs: BlobStore,
    issued: Vec<String>,
}

impl EncodingSession {
    pub fn new(strategy: EncodingStrategy, blobs: BlobStore) -> Self {
        Self {
            strategy,
            blobs,
            issued: Vec::new(),
        }
    }

    pub fn encode(&mut self, source: &str) -> String {
        match self.strategy {
            EncodingStrategy::InlineDataUri => encode_data_uri(source),
            EncodingStrategy::EphemeralBlobUri => {
                let url = self.blobs.register(source);
                self.issued.push(url.clone());
                url
            }
        }
    }
}

impl Drop for EncodingSession {
    fn drop(&mut self) {
        for url in self.issued.drain(..) {
            self.blobs.revoke(&url);
        }
    }
}

pub fn encode_data_uri(source: &str) -> String {
    format!(
        "{}{}",
        DATA_URI_PREFIX,
        base64::engine::general_purpose::STANDARD.encode(source.as_bytes())
    )
}

/// Decode a `data:` URI into module source.
///
/// Accepts base64 payloads as well as plain percent-encoded ones, since
/// callers may hand in either form as a dependency location.
pub fn decode_data_uri(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| anyhow!("Not a data URI: {}", uri))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| anyhow!("Malformed data URI: missing ','"))?;

    let bytes = if meta.split(';').any(|part| part.eq_ignore_ascii_case("base64")) {
        let compact: String = percent_decode_str(payload)
            .decode_utf8()
            .map_err(|e| anyhow!("Invalid data URI payload: {}", e))?
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| anyhow!("Invalid base64 in data URI: {}", e))?
    } else {
        percent_decode_str(payload).collect()
    };

    String::from_utf8(bytes).map_err(|e| anyhow!("Data URI is not valid UTF-8: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("data-uri".parse::<EncodingStrategy>().unwrap(), EncodingStrategy::InlineDataUri);
        assert_eq!(" BLOB-URI ".parse::<EncodingStrategy>().unwrap(), EncodingStrategy::EphemeralBlobUri);
        assert!("gzip".parse::<EncodingStrategy>().is_err());
    }

    #[test]
    fn test_data_uri_decodes_to_source() {
        let source = "export const initminal = () => 'héllo';";
        let uri = encode_data_uri(source);
        assert!(uri.starts_with("data:text/javascript;base64,"));
        assert_eq!(decode_data_uri(&uri).unwrap(), source);
    }

    #[test]
    fn test_percent_encoded_data_uri() {
        let uri = "data:text/javascript,export%20default%201%3B";
        assert_eq!(decode_data_uri(uri).unwrap(), "export default 1;");
    }

    #[test]
    fn test_malformed_data_uri() {
        assert!(decode_data_uri("data:text/javascript;base64").is_err());
        assert!(decode_data_uri("data:;base64,@@@").is_err());
        assert!(decode_data_uri("blob:initminal/x").is_err());
    }

    #[test]
    fn test_session_revokes_blobs_on_drop() {
        let blobs = BlobStore::new();
        let url = {
            let mut session = EncodingSession::new(EncodingStrategy::EphemeralBlobUri, blobs.clone());
            let url = session.encode("export default 1;");
            assert!(url.starts_with("blob:initminal/"));
            assert_eq!(blobs.get(&url).as_deref(), Some("export default 1;"));
            url
        };
        assert!(blobs.get(&url).is_none());
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_blob_urls_are_unique() {
        let blobs = BlobStore::new();
        let a = blobs.register("same");
        let b = blobs.register("same");
        assert_ne!(a, b);
        assert!(blobs.revoke(&a));
        assert!(!blobs.revoke(&a));
        assert_eq!(blobs.len(), 1);
    }
}
