//! Engine configuration.

use std::thread;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const ENV_WORKER_THREADS: &str = "CACHET_WORKER_THREADS";
pub const ENV_FAIL_ON_CACHE_ERROR: &str = "CACHET_FAIL_ON_CACHE_ERROR";
pub const ENV_MAX_PENDING_RETRIES: &str = "CACHET_MAX_PENDING_RETRIES";

/// Request engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker threads of the built-in pool
    pub worker_threads: usize,
    /// Treat cache read/write failures as job failures
    pub fail_on_cache_error: bool,
    /// Capacity of the retry delay queue
    pub max_pending_retries: usize,
    /// Prefix for worker thread names
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            fail_on_cache_error: false,
            max_pending_retries: 1024,
            thread_name: "cachet-worker".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_fail_on_cache_error(mut self, fail: bool) -> Self {
        self.fail_on_cache_error = fail;
        self
    }

    pub fn with_max_pending_retries(mut self, max: usize) -> Self {
        self.max_pending_retries = max.max(1);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Defaults overridden by `CACHET_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `CACHET_*`
    /// keys. Unparseable values are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(threads) = parse_with(&lookup, ENV_WORKER_THREADS, parse_positive) {
            config.worker_threads = threads;
        }
        if let Some(fail) = parse_with(&lookup, ENV_FAIL_ON_CACHE_ERROR, parse_bool) {
            config.fail_on_cache_error = fail;
        }
        if let Some(max) = parse_with(&lookup, ENV_MAX_PENDING_RETRIES, parse_positive) {
            config.max_pending_retries = max;
        }

        config
    }
}

fn parse_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring invalid configuration value");
    }
    parsed
}

fn parse_positive(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|n| *n > 0)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert!(config.worker_threads >= 1);
        assert!(!config.fail_on_cache_error);
        assert_eq!(config.max_pending_retries, 1024);
        assert_eq!(config.thread_name, "cachet-worker");
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_WORKER_THREADS, "3"),
            (ENV_FAIL_ON_CACHE_ERROR, "Yes"),
            (ENV_MAX_PENDING_RETRIES, " 16 "),
        ]));

        assert_eq!(config.worker_threads, 3);
        assert!(config.fail_on_cache_error);
        assert_eq!(config.max_pending_retries, 16);
    }

    #[test]
    fn invalid_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_WORKER_THREADS, "0"),
            (ENV_FAIL_ON_CACHE_ERROR, "maybe"),
            (ENV_MAX_PENDING_RETRIES, "-5"),
        ]));

        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn builder_clamps_to_one() {
        let config = EngineConfig::default()
            .with_worker_threads(0)
            .with_max_pending_retries(0)
            .with_thread_name("jobs");

        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.max_pending_retries, 1);
        assert_eq!(config.thread_name, "jobs");
    }
}
