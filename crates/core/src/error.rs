//! Value-level error model.

use thiserror::Error;

/// Result type used by the core value types.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error raised when constructing or parsing a core value.
///
/// Keep this focused on deterministic input failures. Runtime failures
/// (cache IO, fetch errors) belong to the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A cache key was rejected.
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// A freshness value could not be interpreted.
    #[error("invalid freshness: {0}")]
    InvalidFreshness(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn invalid_freshness(msg: impl Into<String>) -> Self {
        Self::InvalidFreshness(msg.into())
    }
}
