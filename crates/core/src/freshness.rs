//! Cache freshness requirements.
//!
//! A job states how old cached data may be before it is considered expired.
//! Two sentinels exist besides a plain duration:
//!
//! - `AlwaysExpired`: never read the cache, always go to the network
//! - `AlwaysValid`: cached data never expires
//!
//! The millisecond encoding (`-1` / `0` / positive) is kept for configuration
//! files and wire formats that cannot carry the enum.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// How fresh cached data must be to satisfy a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Data older than this is expired.
    MaxAge(Duration),
    /// Cached data is never acceptable.
    AlwaysExpired,
    /// Cached data never expires.
    AlwaysValid,
}

impl Freshness {
    pub const ALWAYS_EXPIRED_MILLIS: i64 = -1;
    pub const ALWAYS_VALID_MILLIS: i64 = 0;

    pub const ONE_SECOND: Duration = Duration::from_secs(1);
    pub const ONE_MINUTE: Duration = Duration::from_secs(60);
    pub const ONE_HOUR: Duration = Duration::from_secs(60 * 60);
    pub const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);
    pub const ONE_WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    pub fn max_age(age: Duration) -> Self {
        if age.is_zero() {
            // Same meaning as the `0` millisecond sentinel.
            Self::AlwaysValid
        } else {
            Self::MaxAge(age)
        }
    }

    /// Decode the millisecond encoding.
    pub fn from_millis(millis: i64) -> CoreResult<Self> {
        match millis {
            Self::ALWAYS_EXPIRED_MILLIS => Ok(Self::AlwaysExpired),
            Self::ALWAYS_VALID_MILLIS => Ok(Self::AlwaysValid),
            m if m > 0 => Ok(Self::MaxAge(Duration::from_millis(m as u64))),
            m => Err(CoreError::invalid_freshness(format!(
                "{m}ms (expected -1, 0 or a positive duration)"
            ))),
        }
    }

    /// Encode as milliseconds (saturating for very large durations).
    pub fn as_millis(&self) -> i64 {
        match self {
            Self::AlwaysExpired => Self::ALWAYS_EXPIRED_MILLIS,
            Self::AlwaysValid => Self::ALWAYS_VALID_MILLIS,
            Self::MaxAge(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Whether a cache read may be attempted at all.
    pub fn allows_cache_read(&self) -> bool {
        !matches!(self, Self::AlwaysExpired)
    }

    /// Whether data of the given age is expired under this requirement.
    pub fn is_expired(&self, age: Duration) -> bool {
        match self {
            Self::AlwaysExpired => true,
            Self::AlwaysValid => false,
            Self::MaxAge(max) => age > *max,
        }
    }
}

impl Default for Freshness {
    fn default() -> Self {
        Self::AlwaysExpired
    }
}
