//! Tracing/logging initialization.
//!
//! Engine code logs through `tracing` macros with structured fields
//! (`job_id`, `attempt`, `elapsed_ms`). The filter comes from `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize JSON logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        ::tracing::debug!("json logging initialized");
    }
}

/// Initialize compact, human-readable logging that plays well with the test
/// harness output capture.
pub fn init_pretty() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .compact()
        .with_thread_names(true)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialization_is_harmless() {
        init_pretty();
        init();
        init_pretty();
        ::tracing::info!(job_id = "test", "still logging");
    }

    #[test]
    fn default_filter_is_info() {
        assert_eq!(DEFAULT_FILTER, "info");
    }
}
