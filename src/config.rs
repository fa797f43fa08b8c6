//! Sandbox configuration
//!
//! Set directly, or loaded from `INITMINAL_*` environment variables.

use crate::encoding::EncodingStrategy;
use crate::fetch::FetchConfig;
use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// Budget applied to jobs that don't set their own timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(3_000);

/// Configuration for a sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Names appended to the minimal safe set (None = default safe set)
    pub whitelist: Option<Vec<String>>,
    /// How inline module source is turned into a loadable location
    pub encoding: EncodingStrategy,
    /// Maximum heap size in bytes (default: 64MB, None = V8 default)
    pub max_heap_size: Option<usize>,
    /// Timeout for jobs that don't specify one (default: 3000ms)
    pub default_timeout: Duration,
    /// Network dependency fetching
    pub fetch: FetchConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            whitelist: None,
            encoding: EncodingStrategy::default(),
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            default_timeout: DEFAULT_TIMEOUT,
            fetch: FetchConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `INITMINAL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`SandboxConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(list) = lookup("INITMINAL_WHITELIST") {
            config.whitelist = Some(split_list(&list));
        }

        if let Some(encoding) = lookup("INITMINAL_ENCODING") {
            config.encoding = encoding.parse().context("INITMINAL_ENCODING")?;
        }

        if let Some(mb) = lookup("INITMINAL_MAX_HEAP_MB") {
            let mb: usize = mb
                .trim()
                .parse()
                .map_err(|e| anyhow!("INITMINAL_MAX_HEAP_MB: invalid number '{}': {}", mb, e))?;
            config.max_heap_size = if mb == 0 { None } else { Some(mb * 1024 * 1024) };
        }

        if let Some(ms) = lookup("INITMINAL_TIMEOUT_MS") {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|e| anyhow!("INITMINAL_TIMEOUT_MS: invalid number '{}': {}", ms, e))?;
            config.default_timeout = Duration::from_millis(ms);
        }

        if let Some(origins) = lookup("INITMINAL_ALLOWED_ORIGINS") {
            config.fetch.allowed_origins = Some(split_list(&origins));
        }

        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}
