//! Runner configuration: timeouts, poll interval, chunk capacity, paths.
//!
//! Defaults follow the reference behavior (2 minute run ceiling, 10 second
//! fetch timeout, tens-of-milliseconds poll interval). Every field has a
//! serde default so a partial config file deserializes cleanly, and every
//! timing knob can be overridden through `CODECELL_*` environment variables
//! for tests and debugging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Overall ceiling for one run, enforced by the host orchestrator
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 120_000;

/// Per-fetch bound for the worker-side poll loop
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Sleep between signal-word reads in the poll loops
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30;

/// Data-region capacity of a shared buffer (one chunk)
pub const DEFAULT_CHUNK_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Overall run timeout in milliseconds
    #[serde(default = "default_run_timeout_ms", rename = "runTimeoutMs")]
    pub run_timeout_ms: u64,
    /// Per-fetch timeout in milliseconds
    #[serde(default = "default_fetch_timeout_ms", rename = "fetchTimeoutMs")]
    pub fetch_timeout_ms: u64,
    /// Poll-loop sleep interval in milliseconds
    #[serde(default = "default_poll_interval_ms", rename = "pollIntervalMs")]
    pub poll_interval_ms: u64,
    /// Shared-buffer data region capacity in bytes
    #[serde(default = "default_chunk_capacity", rename = "chunkCapacity")]
    pub chunk_capacity: usize,
    /// Override for the fetch cache database path
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "cachePath")]
    pub cache_path: Option<String>,
}

fn default_run_timeout_ms() -> u64 {
    DEFAULT_RUN_TIMEOUT_MS
}
fn default_fetch_timeout_ms() -> u64 {
    DEFAULT_FETCH_TIMEOUT_MS
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_chunk_capacity() -> usize {
    DEFAULT_CHUNK_CAPACITY
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            run_timeout_ms: DEFAULT_RUN_TIMEOUT_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            cache_path: None,
        }
    }
}

impl RunnerConfig {
    /// Build a config from defaults plus `CODECELL_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = RunnerConfig::default();

        if let Some(v) = env_u64("CODECELL_RUN_TIMEOUT_MS") {
            config.run_timeout_ms = v;
        }
        if let Some(v) = env_u64("CODECELL_FETCH_TIMEOUT_MS") {
            config.fetch_timeout_ms = v;
        }
        if let Some(v) = env_u64("CODECELL_POLL_INTERVAL_MS") {
            config.poll_interval_ms = v;
        }
        if let Some(v) = env_u64("CODECELL_CHUNK_CAPACITY") {
            config.chunk_capacity = v as usize;
        }
        if let Ok(path) = std::env::var("CODECELL_CACHE_PATH") {
            if !path.is_empty() {
                config.cache_path = Some(path);
            }
        }

        config
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve the fetch cache database path, expanding `~`.
    pub fn resolved_cache_path(&self) -> PathBuf {
        match &self.cache_path {
            Some(p) => PathBuf::from(shellexpand::tilde(p).as_ref()),
            None => dirs::home_dir()
                .map(|h| h.join(".codecell").join("db").join("fetch-cache.sqlite"))
                .unwrap_or_else(|| std::env::temp_dir().join("codecell-fetch-cache.sqlite")),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "Ignoring unparsable environment override");
                None
            }
        },
        Err(_) => None,
    }
}
