//! `cachet-engine` — cached, retry-aware job execution.
//!
//! **Responsibility:** decide, per submitted job, whether to serve from the
//! cache, fall back to a remote fetch, populate the cache, and retry on
//! failure, while running jobs concurrently on a priority-ordered pool.
//!
//! ## Components
//!
//! - `Job`: the work item (cache key, freshness, priority, flags, retry policy,
//!   atomic status and cancellation state)
//! - `RetryPolicy`: stateful retry decisions (`DefaultRetryPolicy`,
//!   `BackoffRetryPolicy`)
//! - `CachePort`: keyed storage with expiry (`InMemoryCache` for tests/dev)
//! - `NetworkAvailability`: connectivity probe (`StaticNetwork`)
//! - `Notifier`: result fan-out (`ChannelNotifier`)
//! - `PriorityExecutor`: worker pool (`PriorityThreadPool`)
//! - `RequestEngine`: composes all of the above

pub mod cache;
pub mod config;
pub mod delay;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod network;
pub mod notifier;
pub mod retry;
pub mod stats;
pub mod status;

mod sync;

pub use cachet_core::{CacheKey, Freshness, JobId};

pub use cache::{CacheError, CachePort, Cacheable, InMemoryCache};
pub use config::EngineConfig;
pub use delay::{DelayError, DelayQueue};
pub use engine::RequestEngine;
pub use error::{EngineError, EngineResult, FailureReason};
pub use executor::{ExecutorError, PriorityExecutor, PriorityThreadPool, TaskHandle, WorkItem};
pub use job::{Fetch, Job};
pub use network::{ConnectivityState, NetworkAvailability, StaticNetwork};
pub use notifier::{
    ChannelNotifier, Notification, NotificationEvent, Notifier, ProgressObserver, Subscription,
};
pub use retry::{
    BackoffRetryPolicy, BackoffStrategy, DefaultRetryPolicy, NoRetryPolicy, RetryPolicy,
};
pub use stats::EngineStats;
pub use status::JobStatus;
