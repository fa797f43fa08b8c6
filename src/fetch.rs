//! Fetching network dependencies as module source.
//!
//! Security model:
//! - Only URLs matching allowed origins can be fetched (when an allowlist is set)
//! - Redirects only followed if they stay within the same origin
//! - Each request is bounded by its own timeout

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use url::Url;

type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// Source of network module text. Swapped out in tests.
#[async_trait]
pub trait ModuleFetcher: Send + Sync {
    async fn fetch_text(&self, url: &Url) -> Result<String>;
}

/// Configuration for dependency fetching
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Allowed origins (e.g., "https://cdn.jsdelivr.net").
    /// An origin is scheme + host + port. `None` allows any origin.
    pub allowed_origins: Option<Vec<String>>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Maximum same-origin redirects followed per request
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            allowed_origins: None,
            timeout: Duration::from_secs(10),
            max_redirects: 5,
        }
    }
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let Some(allowed_origins) = &self.allowed_origins else {
            return true;
        };
        let origin = url.origin().ascii_serialization();
        allowed_origins.iter().any(|allowed| {
            // Exact origin match
            origin == allowed.trim_end_matches('/')
        })
    }
}

/// reqwest-backed fetcher used by default.
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            // Don't follow redirects automatically - we'll handle them manually
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client, config })
    }

    fn fetch_following(&self, url: Url, hops_left: usize) -> FetchFuture<'_> {
        Box::pin(async move {
            if !matches!(url.scheme(), "http" | "https") {
                return Err(anyhow!("Fetch blocked: unsupported scheme '{}'", url.scheme()));
            }

            if !self.config.is_origin_allowed(&url) {
                return Err(anyhow!(
                    "Fetch blocked: origin '{}' is not in the allowlist",
                    url.origin().ascii_serialization()
                ));
            }

            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| anyhow!("Fetch failed for {}: {}", url, e))?;

            let status = response.status();

            // Handle redirects manually - only allow same-origin
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get("location")
                    .ok_or_else(|| anyhow!("Redirect from {} without a location", url))?;
                let location_str = location
                    .to_str()
                    .map_err(|_| anyhow!("Invalid redirect location"))?;
                let redirect_url = url
                    .join(location_str)
                    .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

                if redirect_url.origin() != url.origin() {
                    return Err(anyhow!(
                        "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                        redirect_url.origin().ascii_serialization(),
                        url.origin().ascii_serialization()
                    ));
                }

                if hops_left == 0 {
                    return Err(anyhow!("Fetch failed for {}: too many redirects", url));
                }

                tracing::debug!(from = %url, to = %redirect_url, "following redirect");
                return self.fetch_following(redirect_url, hops_left - 1).await;
            }

            if !status.is_success() {
                return Err(anyhow!(
                    "Fetch failed for {}: {} {}",
                    url,
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                ));
            }

            response
                .text()
                .await
                .map_err(|e| anyhow!("Failed to read response body from {}: {}", url, e))
        })
    }
}

#[async_trait]
impl ModuleFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &Url) -> Result<String> {
        self.fetch_following(url.clone(), self.config.max_redirects).await
    }
}

/// Serves module text from memory. Unknown URLs fail like a 404.
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    modules: HashMap<String, String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, url: impl Into<String>, source: impl Into<String>) -> Self {
        self.modules.insert(url.into(), source.into());
        self
    }
}

#[async_trait]
impl ModuleFetcher for StaticFetcher {
    async fn fetch_text(&self, url: &Url) -> Result<String> {
        self.modules
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| anyhow!("Fetch failed for {}: 404 Not Found", url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: Some(vec![
                "https://cdn.example.com".to_string(),
                "http://localhost:3000/".to_string(),
            ]),
            ..Default::default()
        };

        // Allowed
        assert!(config.is_origin_allowed(&Url::parse("https://cdn.example.com/lodash.js").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("https://cdn.example.com/").unwrap()));
        assert!(config.is_origin_allowed(&Url::parse("http://localhost:3000/dep.mjs").unwrap()));

        // Not allowed
        assert!(!config.is_origin_allowed(&Url::parse("https://evil.com/api").unwrap()));
        assert!(!config.is_origin_allowed(&Url::parse("http://cdn.example.com/x.js").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&Url::parse("https://cdn.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_unrestricted_by_default() {
        let config = FetchConfig::default();
        assert!(config.is_origin_allowed(&Url::parse("https://anything.com/mod.js").unwrap()));
    }

    #[test]
    fn test_empty_allowlist_blocks_everything() {
        let config = FetchConfig {
            allowed_origins: Some(vec![]),
            ..Default::default()
        };

        assert!(!config.is_origin_allowed(&Url::parse("https://anything.com").unwrap()));
    }

    #[tokio::test]
    async fn test_blocked_origin_never_reaches_network() {
        let fetcher = HttpFetcher::new(FetchConfig {
            allowed_origins: Some(vec!["https://cdn.example.com".to_string()]),
            ..Default::default()
        })
        .unwrap();

        let err = fetcher
            .fetch_text(&Url::parse("https://evil.com/payload.js").unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in the allowlist"));
    }

    #[tokio::test]
    async fn test_static_fetcher() {
        let fetcher = StaticFetcher::new().with_module("https://cdn.example.com/a.js", "export default 1;");

        let text = fetcher
            .fetch_text(&Url::parse("https://cdn.example.com/a.js").unwrap())
            .await
            .unwrap();
        assert_eq!(text, "export default 1;");
        assert!(fetcher
            .fetch_text(&Url::parse("https://cdn.example.com/b.js").unwrap())
            .await
            .is_err());
    }
}
