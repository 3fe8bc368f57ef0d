//! Request execution engine.
//!
//! ## Per-attempt algorithm
//!
//! 1. Cache phase (key present, freshness allows a read): a hit settles the
//!    job; a miss may serve stale data provisionally; a read failure either
//!    fails the attempt (`fail_on_cache_error`) or evicts and falls through.
//! 2. Network gate (skipped for offline jobs): no connectivity fails with
//!    [`EngineError::NoNetwork`], never retried.
//! 3. Fetch phase.
//! 4. Cache-write phase (key present): the stored value is delivered; a
//!    tolerated write failure delivers the fetched value and evicts the key.
//!
//! Cancellation is polled before every phase and before every notification.
//! A cancelled attempt ends silently with the status back at `Created`.
//!
//! ## Locking
//!
//! The `stopped` mutex is held only to check the flag and enqueue, or to set
//! it and shut the executor down. Lock order: `stopped`, then the job's
//! handle slot, then the executor queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use cachet_core::{CacheKey, Freshness};

use crate::cache::{CachePort, Cacheable};
use crate::config::EngineConfig;
use crate::delay::{DelayError, DelayQueue};
use crate::error::{EngineError, EngineResult};
use crate::executor::{PriorityExecutor, PriorityThreadPool, panic_message};
use crate::job::{Job, RetryDecision};
use crate::network::NetworkAvailability;
use crate::notifier::Notifier;
use crate::stats::{Counter, EngineStats, StatsCounters};
use crate::status::JobStatus;
use crate::sync::lock;

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Terminal notification delivered; the job is released.
    Settled,
    /// A retry is queued; the job stays in flight.
    Retrying,
    /// Cancelled; nothing was delivered.
    Abandoned,
    /// The engine stopped underneath the attempt.
    Dropped,
}

struct Inner<C, N> {
    cache: C,
    notifier: N,
    network: Arc<dyn NetworkAvailability>,
    executor: Arc<dyn PriorityExecutor>,
    retries: DelayQueue,
    stopped: Mutex<bool>,
    fail_on_cache_error: AtomicBool,
    stats: StatsCounters,
}

/// Runs [`Job`]s against a cache, a network probe and a notifier.
///
/// Cheap to clone; clones share the same pool and state.
pub struct RequestEngine<C, N> {
    inner: Arc<Inner<C, N>>,
}

impl<C, N> Clone for RequestEngine<C, N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, N> RequestEngine<C, N>
where
    C: CachePort + 'static,
    N: Notifier + 'static,
{
    /// Build an engine with its own [`PriorityThreadPool`].
    pub fn new(
        config: EngineConfig,
        cache: C,
        notifier: N,
        network: Arc<dyn NetworkAvailability>,
    ) -> EngineResult<Self> {
        network.check_capability()?;
        let pool = PriorityThreadPool::new(config.worker_threads, &config.thread_name)?;
        Self::build(config, cache, notifier, network, Arc::new(pool))
    }

    /// Build an engine on top of an existing executor.
    pub fn with_executor(
        config: EngineConfig,
        cache: C,
        notifier: N,
        network: Arc<dyn NetworkAvailability>,
        executor: Arc<dyn PriorityExecutor>,
    ) -> EngineResult<Self> {
        network.check_capability()?;
        Self::build(config, cache, notifier, network, executor)
    }

    fn build(
        config: EngineConfig,
        cache: C,
        notifier: N,
        network: Arc<dyn NetworkAvailability>,
        executor: Arc<dyn PriorityExecutor>,
    ) -> EngineResult<Self> {
        let retries = DelayQueue::new(
            config.max_pending_retries,
            &format!("{}-retry", config.thread_name),
        )
        .map_err(|e| EngineError::configuration(e.to_string()))?;

        info!(
            worker_threads = config.worker_threads,
            fail_on_cache_error = config.fail_on_cache_error,
            max_pending_retries = config.max_pending_retries,
            "request engine started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                cache,
                notifier,
                network,
                executor,
                retries,
                stopped: Mutex::new(false),
                fail_on_cache_error: AtomicBool::new(config.fail_on_cache_error),
                stats: StatsCounters::default(),
            }),
        })
    }

    /// Queue `job` for execution.
    ///
    /// Never fails: outcomes arrive through the notifier. A job submitted
    /// after [`stop`](Self::stop), or while a previous submission of the same
    /// job is still in flight, is dropped without notification.
    pub fn submit<T: Cacheable>(&self, job: Arc<Job<T>>) {
        if !job.begin_flight() {
            warn!(job_id = %job.id(), "job already in flight, submission ignored");
            return;
        }
        self.inner.stats.incr(Counter::Submitted);
        Inner::enqueue(&self.inner, job);
    }

    /// Stop accepting work.
    ///
    /// Queued executions and pending retries are discarded; running attempts
    /// finish. Once this returns, no later submission runs.
    pub fn stop(&self) {
        let mut stopped = lock(&self.inner.stopped);
        if *stopped {
            return;
        }
        *stopped = true;
        self.inner.executor.shutdown();
        self.inner.retries.shutdown();
        info!("request engine stopped");
    }

    pub fn is_stopped(&self) -> bool {
        *lock(&self.inner.stopped)
    }

    pub fn fail_on_cache_error(&self) -> bool {
        self.inner.fail_on_cache_error()
    }

    /// Applies to attempts that start after the call.
    pub fn set_fail_on_cache_error(&self, fail: bool) {
        self.inner.fail_on_cache_error.store(fail, Ordering::Release);
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats.snapshot()
    }

    /// Retries waiting for their delay to elapse.
    pub fn pending_retries(&self) -> usize {
        self.inner.retries.len()
    }

    pub fn cache(&self) -> &C {
        &self.inner.cache
    }

    pub fn notifier(&self) -> &N {
        &self.inner.notifier
    }
}

impl<C, N> Inner<C, N>
where
    C: CachePort + 'static,
    N: Notifier + 'static,
{
    fn fail_on_cache_error(&self) -> bool {
        self.fail_on_cache_error.load(Ordering::Acquire)
    }

    fn enqueue<T: Cacheable>(this: &Arc<Self>, job: Arc<Job<T>>) {
        let stopped = lock(&this.stopped);
        if *stopped {
            drop(stopped);
            debug!(job_id = %job.id(), "engine stopped, job dropped");
            this.stats.incr(Counter::Dropped);
            job.end_flight();
            return;
        }

        let inner = Arc::clone(this);
        let task_job = Arc::clone(&job);
        let queued = job.install_handle(|| {
            this.executor.submit(
                job.priority(),
                Box::new(move || inner.run_attempt(task_job)),
            )
        });
        drop(stopped);

        match queued {
            Ok(()) => debug!(job_id = %job.id(), priority = job.priority(), "job queued"),
            Err(err) => {
                warn!(job_id = %job.id(), error = %err, "executor rejected job");
                this.stats.incr(Counter::Dropped);
                job.end_flight();
            }
        }
    }

    fn run_attempt<T: Cacheable>(self: &Arc<Self>, job: Arc<Job<T>>) {
        let attempt = job.record_attempt();
        let started = Instant::now();
        debug!(job_id = %job.id(), attempt, "attempt started");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(&job)));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => self.recover_from_panic(&job, &panic_message(panic.as_ref())),
        };

        match outcome {
            Attempt::Settled | Attempt::Retrying => {}
            Attempt::Abandoned => {
                self.stats.incr(Counter::Cancelled);
                self.release(&job);
                debug!(job_id = %job.id(), attempt, "attempt abandoned after cancellation");
            }
            Attempt::Dropped => self.release(&job),
        }

        debug!(
            job_id = %job.id(),
            attempt,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "attempt finished"
        );
    }

    fn process<T: Cacheable>(self: &Arc<Self>, job: &Arc<Job<T>>) -> Attempt {
        if job.is_cancelled() {
            return Attempt::Abandoned;
        }

        if let Some(key) = job.cache_key() {
            if job.freshness().allows_cache_read() {
                if let Some(outcome) = self.read_cache(job, key) {
                    return outcome;
                }
            }
        }

        if job.is_cancelled() {
            return Attempt::Abandoned;
        }
        if !job.is_offline() && !self.network.is_available() {
            return self.fail(job, EngineError::NoNetwork);
        }

        if job.is_cancelled() {
            return Attempt::Abandoned;
        }
        self.set_status(job, JobStatus::LoadingFromNetwork);
        let progress = self.notifier.attach_progress_observer(&**job);
        let phase = Instant::now();
        let fetched = job.fetch(&progress);
        debug!(
            job_id = %job.id(),
            elapsed_ms = phase.elapsed().as_millis() as u64,
            ok = fetched.is_ok(),
            "fetch finished"
        );
        let value = match fetched {
            Ok(value) => value,
            Err(_) if job.is_cancelled() => {
                debug!(job_id = %job.id(), "fetch error ignored, job cancelled");
                return Attempt::Abandoned;
            }
            Err(err) => return self.fail_or_retry(job, EngineError::NetworkFetch(err)),
        };

        if job.is_cancelled() {
            return Attempt::Abandoned;
        }
        match job.cache_key() {
            Some(key) => self.write_cache(job, key, value),
            None => self.succeed(job, value),
        }
    }

    /// `Some` when the cache phase decided the attempt.
    fn read_cache<T: Cacheable>(
        self: &Arc<Self>,
        job: &Arc<Job<T>>,
        key: &CacheKey,
    ) -> Option<Attempt> {
        self.set_status(job, JobStatus::ReadingFromCache);
        let phase = Instant::now();
        let loaded = self.cache.load::<T>(key, job.freshness());
        let elapsed_ms = phase.elapsed().as_millis() as u64;

        match loaded {
            Ok(Some(value)) => {
                debug!(job_id = %job.id(), %key, elapsed_ms, "cache hit");
                Some(self.succeed(job, value))
            }
            Ok(None) => {
                debug!(job_id = %job.id(), %key, elapsed_ms, "cache miss");
                if job.accepts_stale_cache() && !job.provisional_served() {
                    self.serve_stale(job, key);
                }
                None
            }
            Err(err) if self.fail_on_cache_error() => {
                Some(self.fail_or_retry(job, EngineError::CacheRead(err)))
            }
            Err(err) => {
                warn!(job_id = %job.id(), %key, error = %err, "cache read failed, evicting");
                self.evict::<T>(job, key);
                None
            }
        }
    }

    fn serve_stale<T: Cacheable>(&self, job: &Arc<Job<T>>, key: &CacheKey) {
        match self.cache.load::<T>(key, Freshness::AlwaysValid) {
            Ok(Some(value)) => {
                if job.is_cancelled() || !job.claim_provisional() {
                    return;
                }
                self.stats.incr(Counter::Provisional);
                debug!(job_id = %job.id(), %key, "serving stale cache value");
                self.notifier.on_provisional_success(&**job, value);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(job_id = %job.id(), %key, error = %err, "stale cache read failed");
            }
        }
    }

    fn write_cache<T: Cacheable>(
        self: &Arc<Self>,
        job: &Arc<Job<T>>,
        key: &CacheKey,
        value: T,
    ) -> Attempt {
        self.set_status(job, JobStatus::WritingToCache);
        let phase = Instant::now();
        let saved = self.cache.save(&value, key);
        debug!(
            job_id = %job.id(),
            %key,
            elapsed_ms = phase.elapsed().as_millis() as u64,
            ok = saved.is_ok(),
            "cache write finished"
        );

        match saved {
            Ok(stored) => self.succeed(job, stored),
            Err(err) if self.fail_on_cache_error() => {
                self.fail_or_retry(job, EngineError::CacheWrite(err))
            }
            Err(err) => {
                warn!(job_id = %job.id(), %key, error = %err, "cache write failed, delivering fetched value");
                self.evict::<T>(job, key);
                self.succeed(job, value)
            }
        }
    }

    fn succeed<T: Cacheable>(&self, job: &Arc<Job<T>>, value: T) -> Attempt {
        if job.is_cancelled() {
            return Attempt::Abandoned;
        }
        if !self.settle(job, JobStatus::Complete) {
            return Attempt::Settled;
        }
        self.stats.incr(Counter::Succeeded);
        info!(job_id = %job.id(), attempts = job.attempts(), "job succeeded");
        self.notifier.on_success(&**job, value);
        Attempt::Settled
    }

    fn fail<T: Cacheable>(&self, job: &Arc<Job<T>>, err: EngineError) -> Attempt {
        if job.is_cancelled() {
            return Attempt::Abandoned;
        }
        if !self.settle(job, JobStatus::Failed) {
            return Attempt::Settled;
        }
        self.stats.incr(Counter::Failed);
        info!(
            job_id = %job.id(),
            attempts = job.attempts(),
            reason = ?err.reason(),
            error = %err,
            "job failed"
        );
        self.notifier.on_failure(&**job, &err);
        Attempt::Settled
    }

    fn fail_or_retry<T: Cacheable>(self: &Arc<Self>, job: &Arc<Job<T>>, err: EngineError) -> Attempt {
        if job.is_cancelled() {
            return Attempt::Abandoned;
        }

        let delay = match job.next_retry(&err) {
            RetryDecision::NoPolicy => return self.fail(job, err),
            RetryDecision::Exhausted => {
                warn!(job_id = %job.id(), attempts = job.attempts(), "retries exhausted");
                return self.fail(job, err);
            }
            RetryDecision::RetryAfter(delay) => delay,
        };

        job.detach_handle();
        self.set_status(job, JobStatus::Created);
        match self.schedule_retry(job, delay) {
            Ok(()) => {
                self.stats.incr(Counter::Retried);
                info!(
                    job_id = %job.id(),
                    attempt = job.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retry scheduled"
                );
                Attempt::Retrying
            }
            Err(DelayError::ShutDown) => {
                debug!(job_id = %job.id(), "engine stopped, retry dropped");
                self.stats.incr(Counter::Dropped);
                Attempt::Dropped
            }
            Err(rejected) => {
                warn!(job_id = %job.id(), error = %err, "retry rejected: {rejected}");
                self.fail(job, EngineError::RetryRejected(rejected))
            }
        }
    }

    fn schedule_retry<T: Cacheable>(
        self: &Arc<Self>,
        job: &Arc<Job<T>>,
        delay: Duration,
    ) -> Result<(), DelayError> {
        let inner = Arc::clone(self);
        let retry_job = Arc::clone(job);
        self.retries
            .schedule(delay, Box::new(move || Inner::enqueue(&inner, retry_job)))
    }

    fn recover_from_panic<T: Cacheable>(&self, job: &Arc<Job<T>>, message: &str) -> Attempt {
        self.stats.incr(Counter::Panicked);
        error!(job_id = %job.id(), panic = %message, "job panicked");
        if job.is_settled() {
            return Attempt::Settled;
        }
        self.fail(job, EngineError::Internal(message.to_string()))
    }

    /// Move to a terminal status and release the job, once.
    fn settle<T: Cacheable>(&self, job: &Arc<Job<T>>, status: JobStatus) -> bool {
        if !job.settle() {
            return false;
        }
        self.set_status(job, status);
        job.detach_handle();
        job.end_flight();
        true
    }

    fn release<T: Cacheable>(&self, job: &Arc<Job<T>>) {
        job.set_status(JobStatus::Created);
        job.detach_handle();
        job.end_flight();
    }

    fn evict<T: Cacheable>(&self, job: &Arc<Job<T>>, key: &CacheKey) {
        if let Err(err) = self.cache.remove::<T>(key) {
            warn!(job_id = %job.id(), %key, error = %err, "cache eviction failed");
        }
    }

    fn set_status<T: Cacheable>(&self, job: &Arc<Job<T>>, status: JobStatus) {
        job.set_status(status);
        self.notifier.on_status(&**job, status);
    }
}
