//! Job descriptor.
//!
//! A [`Job`] is created and configured by the caller, then shared with the
//! engine through an `Arc`. Its configuration is immutable once built; the
//! mutable parts (status, cancellation, in-flight guard, execution handle)
//! sit behind atomics and a narrow crate-private interface.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use cachet_core::{CacheKey, Freshness, JobId};

use crate::error::EngineError;
use crate::executor::TaskHandle;
use crate::notifier::ProgressObserver;
use crate::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::status::{AtomicStatus, JobStatus};
use crate::sync::lock;

/// The remote half of a job: produces a fresh value.
///
/// Any error is reported as [`EngineError::NetworkFetch`] and may be retried.
pub trait Fetch<T>: Send + Sync {
    fn fetch(&self, progress: &ProgressObserver) -> anyhow::Result<T>;
}

impl<T, F> Fetch<T> for F
where
    F: Fn(&ProgressObserver) -> anyhow::Result<T> + Send + Sync,
{
    fn fetch(&self, progress: &ProgressObserver) -> anyhow::Result<T> {
        self(progress)
    }
}

/// What the retry policy decided about a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    NoPolicy,
    Exhausted,
    RetryAfter(Duration),
}

/// A unit of work: read from the cache, or fetch and populate it.
pub struct Job<T> {
    id: JobId,
    cache_key: Option<CacheKey>,
    freshness: Freshness,
    accepts_stale_cache: bool,
    offline: bool,
    priority: i32,
    retry_policy: Option<Mutex<Box<dyn RetryPolicy>>>,
    fetcher: Box<dyn Fetch<T>>,

    status: AtomicStatus,
    cancelled: AtomicBool,
    in_flight: AtomicBool,
    settled: AtomicBool,
    provisional_served: AtomicBool,
    attempts: AtomicU32,
    handle: Mutex<Option<TaskHandle>>,
}

impl<T: 'static> Job<T> {
    /// Create a job around a fetch closure.
    ///
    /// Defaults: no cache key, `Freshness::AlwaysExpired`, priority 0, online
    /// only, no stale fallback, [`DefaultRetryPolicy`].
    pub fn new<F>(fetch: F) -> Self
    where
        F: Fn(&ProgressObserver) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        Self::from_fetch(fetch)
    }

    /// Create a job around any [`Fetch`] implementation.
    pub fn from_fetch(fetch: impl Fetch<T> + 'static) -> Self {
        Self {
            id: JobId::new(),
            cache_key: None,
            freshness: Freshness::default(),
            accepts_stale_cache: false,
            offline: false,
            priority: 0,
            retry_policy: Some(Mutex::new(Box::new(DefaultRetryPolicy::default()))),
            fetcher: Box::new(fetch),
            status: AtomicStatus::new(JobStatus::Created),
            cancelled: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            settled: AtomicBool::new(false),
            provisional_served: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            handle: Mutex::new(None),
        }
    }

    pub fn with_cache_key(mut self, key: CacheKey) -> Self {
        self.cache_key = Some(key);
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    /// Serve expired cached data provisionally while the network refresh runs.
    pub fn with_stale_cache(mut self, accepts: bool) -> Self {
        self.accepts_stale_cache = accepts;
        self
    }

    /// Offline jobs run their fetch even when the network is unavailable.
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Higher runs sooner.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Mutex::new(Box::new(policy)));
        self
    }

    /// Fail on the first error.
    pub fn without_retry(mut self) -> Self {
        self.retry_policy = None;
        self
    }
}

impl<T> Job<T> {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn cache_key(&self) -> Option<&CacheKey> {
        self.cache_key.as_ref()
    }

    pub fn freshness(&self) -> Freshness {
        self.freshness
    }

    pub fn accepts_stale_cache(&self) -> bool {
        self.accepts_stale_cache
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn status(&self) -> JobStatus {
        self.status.load()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the engine currently owns an execution of this job.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Attempts started so far, retries included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Retries the policy still allows; `None` without a policy.
    pub fn remaining_retries(&self) -> Option<u32> {
        self.retry_policy
            .as_ref()
            .map(|policy| lock(policy).retry_count())
    }

    /// Cancel the job.
    ///
    /// Takes effect at the next check-point of a running attempt. An
    /// execution still waiting in the executor queue is withdrawn and the job
    /// is released at once. Cancellation is permanent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let mut slot = lock(&self.handle);
        if slot.as_ref().is_some_and(TaskHandle::cancel) {
            // No worker will pick it up, so nothing else releases the job.
            slot.take();
            self.status.store(JobStatus::Created);
            self.end_flight();
            debug!(job_id = %self.id, "queued execution withdrawn");
        }
        debug!(job_id = %self.id, "job cancelled");
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.status.store(status);
    }

    /// Claim the job for a new logical request.
    pub(crate) fn begin_flight(&self) -> bool {
        let claimed = self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.settled.store(false, Ordering::Release);
            self.provisional_served.store(false, Ordering::Release);
        }
        claimed
    }

    pub(crate) fn end_flight(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Returns `true` for the first caller only; guards the terminal event.
    pub(crate) fn settle(&self) -> bool {
        !self.settled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Returns `true` for the first caller of each flight; guards the
    /// provisional event across retries.
    pub(crate) fn claim_provisional(&self) -> bool {
        !self.provisional_served.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn provisional_served(&self) -> bool {
        self.provisional_served.load(Ordering::Acquire)
    }

    /// Submit through `submit` while holding the handle slot.
    ///
    /// The attempt cannot detach its handle before it is stored, and a
    /// concurrent `cancel` either sees the new handle or runs after it.
    pub(crate) fn install_handle<E>(
        &self,
        submit: impl FnOnce() -> Result<TaskHandle, E>,
    ) -> Result<(), E> {
        let mut slot = lock(&self.handle);
        *slot = Some(submit()?);
        Ok(())
    }

    pub(crate) fn detach_handle(&self) {
        lock(&self.handle).take();
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn fetch(&self, progress: &ProgressObserver) -> anyhow::Result<T> {
        self.fetcher.fetch(progress)
    }

    /// Report `error` to the retry policy and decide whether to go again.
    ///
    /// The remaining budget is read before the policy sees the error, so a
    /// policy allowing `n` retries yields `n + 1` attempts. The policy is told
    /// about every failure, the final one included.
    pub(crate) fn next_retry(&self, error: &EngineError) -> RetryDecision {
        let Some(policy) = &self.retry_policy else {
            return RetryDecision::NoPolicy;
        };
        let mut policy = lock(policy);
        let remaining = policy.retry_count();
        policy.retry(error);
        if remaining == 0 {
            return RetryDecision::Exhausted;
        }
        RetryDecision::RetryAfter(policy.delay_before_retry())
    }
}

impl<T> core::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cache_key", &self.cache_key)
            .field("freshness", &self.freshness)
            .field("accepts_stale_cache", &self.accepts_stale_cache)
            .field("offline", &self.offline)
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::NoRetryPolicy;
    use std::sync::Arc;

    fn job() -> Job<String> {
        Job::new(|_: &ProgressObserver| Ok("payload".to_string()))
    }

    #[test]
    fn defaults() {
        let job = job();
        assert_eq!(job.cache_key(), None);
        assert_eq!(job.freshness(), Freshness::AlwaysExpired);
        assert_eq!(job.priority(), 0);
        assert!(!job.accepts_stale_cache());
        assert!(!job.is_offline());
        assert_eq!(job.status(), JobStatus::Created);
        assert_eq!(
            job.remaining_retries(),
            Some(DefaultRetryPolicy::DEFAULT_RETRY_COUNT)
        );
    }

    #[test]
    fn builder_sets_every_field() {
        let key = CacheKey::new("weather:lyon").unwrap();
        let job = job()
            .with_cache_key(key.clone())
            .with_freshness(Freshness::max_age(Freshness::ONE_HOUR))
            .with_stale_cache(true)
            .with_offline(true)
            .with_priority(7)
            .with_retry_policy(NoRetryPolicy);

        assert_eq!(job.cache_key(), Some(&key));
        assert_eq!(job.freshness(), Freshness::MaxAge(Freshness::ONE_HOUR));
        assert!(job.accepts_stale_cache());
        assert!(job.is_offline());
        assert_eq!(job.priority(), 7);
        assert_eq!(job.remaining_retries(), Some(0));
        assert_eq!(self::job().without_retry().remaining_retries(), None);
    }

    #[test]
    fn only_one_flight_at_a_time() {
        let job = job();
        assert!(job.begin_flight());
        assert!(!job.begin_flight());
        job.end_flight();
        assert!(job.begin_flight());
    }

    #[test]
    fn settle_succeeds_once_per_flight() {
        let job = job();
        assert!(job.begin_flight());
        assert!(job.settle());
        assert!(!job.settle());

        job.end_flight();
        assert!(job.begin_flight());
        assert!(!job.is_settled());
    }

    #[test]
    fn cancel_withdraws_queued_execution() {
        let job = job();
        assert!(job.begin_flight());
        let handle = TaskHandle::new();
        job.install_handle(|| Ok::<_, ()>(handle.clone())).unwrap();

        job.cancel();

        assert!(job.is_cancelled());
        assert!(handle.is_cancelled());
        assert!(!job.is_in_flight());
    }

    #[test]
    fn cancel_leaves_started_execution_to_the_attempt() {
        let job = job();
        assert!(job.begin_flight());
        let handle = TaskHandle::new();
        job.install_handle(|| Ok::<_, ()>(handle.clone())).unwrap();
        assert!(handle.try_start());

        job.cancel();

        assert!(job.is_cancelled());
        assert!(!handle.is_cancelled());
        assert!(job.is_in_flight());
    }

    #[test]
    fn retry_decisions_follow_the_policy() {
        let err = EngineError::NetworkFetch(anyhow::anyhow!("timeout"));
        let job = job().with_retry_policy(DefaultRetryPolicy::new(1, Duration::from_millis(5), 1.0));

        assert_eq!(
            job.next_retry(&err),
            RetryDecision::RetryAfter(Duration::from_millis(5))
        );
        assert_eq!(job.next_retry(&err), RetryDecision::Exhausted);
        assert_eq!(self::job().without_retry().next_retry(&err), RetryDecision::NoPolicy);
    }

    struct Recorder {
        seen: Arc<AtomicU32>,
        budget: u32,
    }

    impl RetryPolicy for Recorder {
        fn retry_count(&self) -> u32 {
            self.budget
        }

        fn retry(&mut self, _error: &EngineError) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.budget = self.budget.saturating_sub(1);
        }

        fn delay_before_retry(&self) -> Duration {
            Duration::ZERO
        }
    }

    #[test]
    fn policy_sees_the_final_failure_too() {
        let err = EngineError::NetworkFetch(anyhow::anyhow!("timeout"));
        let seen = Arc::new(AtomicU32::new(0));
        let job = job().with_retry_policy(Recorder {
            seen: Arc::clone(&seen),
            budget: 2,
        });

        assert_eq!(job.next_retry(&err), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(job.next_retry(&err), RetryDecision::RetryAfter(Duration::ZERO));
        assert_eq!(job.next_retry(&err), RetryDecision::Exhausted);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn provisional_is_claimed_once_per_flight() {
        let job = job();
        assert!(job.begin_flight());
        assert!(!job.provisional_served());
        assert!(job.claim_provisional());
        assert!(!job.claim_provisional());
        assert!(job.provisional_served());

        job.end_flight();
        assert!(job.begin_flight());
        assert!(job.claim_provisional());
    }

    #[test]
    fn fetch_runs_the_closure() {
        let job = job();
        assert_eq!(job.fetch(&ProgressObserver::noop()).unwrap(), "payload");
        assert_eq!(job.record_attempt(), 1);
        assert_eq!(job.record_attempt(), 2);
        assert_eq!(job.attempts(), 2);
    }
}
