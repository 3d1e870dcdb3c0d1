//! Runtime configuration for update runs.
//!
//! One config value carries every tunable the engine needs. Each field has
//! a documented default and can be overridden through an `UPDATE_*`
//! environment variable; callers with typed options apply their overrides
//! on top of [`UpdateConfig::from_env`].

use serde::{Deserialize, Serialize};

use flakeup_types::DEFAULT_FAKE_HASH;

/// Default user agent sent on forge requests.
pub const USER_AGENT: &str = concat!("flakeup/", env!("CARGO_PKG_VERSION"));

/// Platforms the Deno dependency resolver is sharded across.
pub const DEFAULT_DENO_PLATFORMS: [&str; 3] =
    ["aarch64-darwin", "aarch64-linux", "x86_64-linux"];

/// Return a conservative default for concurrent `nix build` jobs.
///
/// Each impure overlay evaluation holds 1-2 GB of RAM, so the cap is
/// ~70% of the available cores, never below one.
pub fn default_max_nix_builds() -> usize {
    let cores = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4);
    ((cores * 7 + 9) / 10).max(1)
}

/// Resolved runtime configuration for update operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// HTTP request timeout in seconds (`UPDATE_HTTP_TIMEOUT`, default 30).
    pub http_timeout: u64,
    /// Subprocess wall-clock timeout in seconds
    /// (`UPDATE_SUBPROCESS_TIMEOUT`, default 1200 — builds are slow).
    pub subprocess_timeout: u64,
    /// Lines of output tail kept for failure reporting
    /// (`UPDATE_LOG_TAIL_LINES`, default 10, min 1).
    pub log_tail_lines: usize,
    /// User agent for forge requests (`UPDATE_USER_AGENT`).
    pub user_agent: String,
    /// HTTP retry attempts (`UPDATE_RETRIES`, default 3).
    pub retries: u32,
    /// Base backoff in seconds between HTTP retries
    /// (`UPDATE_RETRY_BACKOFF`, default 1.0).
    pub retry_backoff: f64,
    /// Placeholder digest used to provoke hash mismatches
    /// (`UPDATE_FAKE_HASH`).
    pub fake_hash: String,
    /// Concurrent `nix build` cap (`UPDATE_MAX_NIX_BUILDS`, min 1).
    pub max_nix_builds: usize,
    /// Platforms for Deno dependency hashes (`UPDATE_DENO_PLATFORMS`,
    /// comma-separated).
    pub deno_platforms: Vec<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            http_timeout: 30,
            subprocess_timeout: 1200,
            log_tail_lines: 10,
            user_agent: USER_AGENT.to_string(),
            retries: 3,
            retry_backoff: 1.0,
            fake_hash: DEFAULT_FAKE_HASH.to_string(),
            max_nix_builds: default_max_nix_builds(),
            deno_platforms: DEFAULT_DENO_PLATFORMS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl UpdateConfig {
    /// Resolve configuration from `UPDATE_*` environment variables on top
    /// of the documented defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse("UPDATE_HTTP_TIMEOUT") {
            config.http_timeout = value;
        }
        if let Some(value) = env_parse("UPDATE_SUBPROCESS_TIMEOUT") {
            config.subprocess_timeout = value;
        }
        if let Some(value) = env_parse::<usize>("UPDATE_LOG_TAIL_LINES") {
            config.log_tail_lines = value.max(1);
        }
        if let Ok(value) = std::env::var("UPDATE_USER_AGENT")
            && !value.trim().is_empty()
        {
            config.user_agent = value;
        }
        if let Some(value) = env_parse("UPDATE_RETRIES") {
            config.retries = value;
        }
        if let Some(value) = env_parse("UPDATE_RETRY_BACKOFF") {
            config.retry_backoff = value;
        }
        if let Ok(value) = std::env::var("UPDATE_FAKE_HASH")
            && !value.trim().is_empty()
        {
            config.fake_hash = value;
        }
        if let Some(value) = env_parse::<usize>("UPDATE_MAX_NIX_BUILDS") {
            config.max_nix_builds = value.max(1);
        }
        if let Ok(value) = std::env::var("UPDATE_DENO_PLATFORMS") {
            let platforms: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if !platforms.is_empty() {
                config.deno_platforms = platforms;
            }
        }
        config
    }
}
