//! Retry policies.
//!
//! A policy is a small stateful object owned by one job. The engine asks it
//! how many retries remain, informs it of each failure it retries, and sleeps
//! for the delay it reports before resubmitting the job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Decides whether and when a failed job is retried.
pub trait RetryPolicy: Send {
    /// Retries still allowed.
    fn retry_count(&self) -> u32;

    /// Consume one retry for `error`; may adjust the delay (backoff).
    fn retry(&mut self, error: &EngineError);

    /// Delay to wait before the next attempt.
    fn delay_before_retry(&self) -> Duration;
}

/// Fixed retry budget with a multiplicative backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultRetryPolicy {
    retry_count: u32,
    delay: Duration,
    backoff_multiplier: f32,
}

impl DefaultRetryPolicy {
    pub const DEFAULT_RETRY_COUNT: u32 = 3;
    pub const DEFAULT_DELAY_BEFORE_RETRY: Duration = Duration::from_millis(2500);
    pub const DEFAULT_BACKOFF_MULTIPLIER: f32 = 1.0;

    pub fn new(retry_count: u32, delay: Duration, backoff_multiplier: f32) -> Self {
        Self {
            retry_count,
            delay,
            // Multiplier must be finite and non-negative.
            backoff_multiplier: if backoff_multiplier.is_finite() && backoff_multiplier >= 0.0 {
                backoff_multiplier
            } else {
                Self::DEFAULT_BACKOFF_MULTIPLIER
            },
        }
    }

    pub fn backoff_multiplier(&self) -> f32 {
        self.backoff_multiplier
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_RETRY_COUNT,
            Self::DEFAULT_DELAY_BEFORE_RETRY,
            Self::DEFAULT_BACKOFF_MULTIPLIER,
        )
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn retry(&mut self, _error: &EngineError) {
        self.retry_count = self.retry_count.saturating_sub(1);
        let nanos = (self.delay.as_nanos() as f64 * f64::from(self.backoff_multiplier)).round();
        self.delay = Duration::from_nanos(nanos.min(u64::MAX as f64) as u64);
    }

    fn delay_before_retry(&self) -> Duration {
        self.delay
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn retry_count(&self) -> u32 {
        0
    }

    fn retry(&mut self, _error: &EngineError) {}

    fn delay_before_retry(&self) -> Duration {
        Duration::ZERO
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy with a capped backoff curve and deterministic jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffRetryPolicy {
    /// Maximum number of retries (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
    /// Retries consumed so far
    #[serde(default)]
    attempt: u32,
}

impl Default for BackoffRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            attempt: 0,
        }
    }
}

impl BackoffRetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
            attempt: 0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
            attempt: 0,
        }
    }

    /// Create a policy with linear backoff.
    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Retries consumed so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Calculate delay for a given retry number (1-indexed), never above
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms.min(max_ms),
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            // Deterministic spread derived from the attempt number.
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        // The cap also bounds the jittered delay.
        Duration::from_millis((delay_ms + jitter).max(0.0).min(max_ms) as u64)
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn retry_count(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt)
    }

    fn retry(&mut self, _error: &EngineError) {
        self.attempt = self.attempt.saturating_add(1);
    }

    fn delay_before_retry(&self) -> Duration {
        self.delay_for_attempt(self.attempt.max(1))
    }
}
