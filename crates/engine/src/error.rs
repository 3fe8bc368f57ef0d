//! Engine error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheError;
use crate::delay::DelayError;
use crate::executor::ExecutorError;

/// Result type used by engine construction.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure delivered to the notifier (or returned from engine construction).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Connectivity is absent and the job requires it. Never retried.
    #[error("network is not available")]
    NoNetwork,

    /// The job's fetch behavior failed.
    #[error("network fetch failed: {0}")]
    NetworkFetch(#[source] anyhow::Error),

    /// Loading from the cache failed (only surfaced with `fail_on_cache_error`).
    #[error("cache read failed: {0}")]
    CacheRead(#[source] CacheError),

    /// Saving to the cache failed (only surfaced with `fail_on_cache_error`).
    #[error("cache write failed: {0}")]
    CacheWrite(#[source] CacheError),

    /// Required capabilities are missing; raised at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The retry could not be queued.
    #[error("retry could not be scheduled: {0}")]
    RetryRejected(#[source] DelayError),

    /// A worker panicked while processing the job.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            EngineError::NoNetwork => FailureReason::NoNetwork,
            EngineError::NetworkFetch(_) => FailureReason::NetworkFetch,
            EngineError::CacheRead(_) => FailureReason::CacheRead,
            EngineError::CacheWrite(_) => FailureReason::CacheWrite,
            EngineError::Configuration(_) => FailureReason::Configuration,
            EngineError::RetryRejected(_) => FailureReason::RetryRejected,
            EngineError::Internal(_) => FailureReason::Internal,
        }
    }

    /// Whether the retry policy is consulted for this failure.
    pub fn is_retryable(&self) -> bool {
        self.reason().is_retryable()
    }
}

impl From<ExecutorError> for EngineError {
    fn from(value: ExecutorError) -> Self {
        Self::Configuration(value.to_string())
    }
}

/// Serializable classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoNetwork,
    NetworkFetch,
    CacheRead,
    CacheWrite,
    Configuration,
    RetryRejected,
    Internal,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureReason::NetworkFetch | FailureReason::CacheRead | FailureReason::CacheWrite
        )
    }
}
