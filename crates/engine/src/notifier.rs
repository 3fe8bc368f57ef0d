//! Result notification (mechanics only).
//!
//! The engine reports every outcome through a [`Notifier`]. It never returns
//! errors to the caller of `submit`; whoever waits for a job listens here.
//!
//! ## Delivery
//!
//! - Exactly one terminal event (success or failure) per logical request,
//!   unless the job is cancelled
//! - At most one provisional success per attempt, always before the terminal
//!   event of that attempt
//! - Status and progress events are informational and may be dropped by
//!   implementations that do not care about them
//!
//! [`ChannelNotifier`] is the in-process implementation: a broadcast of
//! [`Notification`]s to `mpsc` subscriptions.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use cachet_core::JobId;

use crate::cache::Cacheable;
use crate::error::{EngineError, FailureReason};
use crate::job::Job;
use crate::status::JobStatus;
use crate::sync::lock;

/// Receives job outcomes from the engine.
///
/// Implementations must tolerate concurrent calls for different jobs.
pub trait Notifier: Send + Sync {
    fn on_success<T: Cacheable>(&self, job: &Job<T>, value: T);

    /// Stale cached data served while a refresh is still running.
    fn on_provisional_success<T: Cacheable>(&self, job: &Job<T>, value: T);

    fn on_failure<T: Cacheable>(&self, job: &Job<T>, error: &EngineError);

    /// Observer handed to the fetch behavior for fine-grained progress.
    fn attach_progress_observer<T: Cacheable>(&self, job: &Job<T>) -> ProgressObserver;

    /// Status transition of a running job.
    fn on_status<T: Cacheable>(&self, _job: &Job<T>, _status: JobStatus) {}
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn on_success<T: Cacheable>(&self, job: &Job<T>, value: T) {
        (**self).on_success(job, value)
    }

    fn on_provisional_success<T: Cacheable>(&self, job: &Job<T>, value: T) {
        (**self).on_provisional_success(job, value)
    }

    fn on_failure<T: Cacheable>(&self, job: &Job<T>, error: &EngineError) {
        (**self).on_failure(job, error)
    }

    fn attach_progress_observer<T: Cacheable>(&self, job: &Job<T>) -> ProgressObserver {
        (**self).attach_progress_observer(job)
    }

    fn on_status<T: Cacheable>(&self, job: &Job<T>, status: JobStatus) {
        (**self).on_status(job, status)
    }
}

type ProgressSink = Arc<dyn Fn(f32) + Send + Sync>;

/// Progress reporter handed to a job's fetch behavior.
#[derive(Clone, Default)]
pub struct ProgressObserver {
    sink: Option<ProgressSink>,
}

impl ProgressObserver {
    pub fn new(sink: impl Fn(f32) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// An observer that discards every report.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Report completion as a fraction; clamped to `[0, 1]`, NaN ignored.
    pub fn report(&self, fraction: f32) {
        if fraction.is_nan() {
            return;
        }
        if let Some(sink) = &self.sink {
            sink(fraction.clamp(0.0, 1.0));
        }
    }
}

impl core::fmt::Debug for ProgressObserver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressObserver")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// One delivered event.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub job_id: JobId,
    pub at: DateTime<Utc>,
    pub event: NotificationEvent,
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    Success { value: serde_json::Value },
    ProvisionalSuccess { value: serde_json::Value },
    Failure { reason: FailureReason, message: String },
    Status { status: JobStatus },
    Progress { fraction: f32 },
}

impl NotificationEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationEvent::Success { .. } | NotificationEvent::Failure { .. }
        )
    }
}

/// A subscription to a [`ChannelNotifier`].
#[derive(Debug)]
pub struct Subscription {
    receiver: Receiver<Notification>,
}

impl Subscription {
    /// Block until the next notification is available.
    pub fn recv(&self) -> Result<Notification, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a notification without blocking.
    pub fn try_recv(&self) -> Result<Notification, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a notification.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Notification, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Collect everything for `job_id` up to and including its terminal event.
    ///
    /// Returns what was gathered if `timeout` elapses first.
    pub fn until_terminal(&self, job_id: JobId, timeout: Duration) -> Vec<NotificationEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(remaining) {
                Ok(n) if n.job_id == job_id => {
                    let terminal = n.event.is_terminal();
                    events.push(n.event);
                    if terminal {
                        return events;
                    }
                }
                Ok(_) => continue,
                Err(_) => return events,
            }
        }
    }
}

/// In-process broadcast notifier.
///
/// - No IO
/// - Values are converted to JSON so subscribers need not know `T`
/// - Dead subscribers are dropped on the next publish
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Notification>>>>,
}

impl ChannelNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        Subscription { receiver: rx }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn publish(&self, job_id: JobId, event: NotificationEvent) {
        broadcast(&self.subscribers, job_id, event);
    }

    fn to_json<T: Cacheable>(job_id: JobId, value: &T) -> serde_json::Value {
        serde_json::to_value(value).unwrap_or_else(|err| {
            warn!(job_id = %job_id, error = %err, "result is not representable as json");
            serde_json::Value::Null
        })
    }
}

fn broadcast(
    subscribers: &Mutex<Vec<mpsc::Sender<Notification>>>,
    job_id: JobId,
    event: NotificationEvent,
) {
    let notification = Notification {
        job_id,
        at: Utc::now(),
        event,
    };
    lock(subscribers).retain(|tx| tx.send(notification.clone()).is_ok());
}

impl Notifier for ChannelNotifier {
    fn on_success<T: Cacheable>(&self, job: &Job<T>, value: T) {
        let value = Self::to_json(job.id(), &value);
        self.publish(job.id(), NotificationEvent::Success { value });
    }

    fn on_provisional_success<T: Cacheable>(&self, job: &Job<T>, value: T) {
        let value = Self::to_json(job.id(), &value);
        self.publish(job.id(), NotificationEvent::ProvisionalSuccess { value });
    }

    fn on_failure<T: Cacheable>(&self, job: &Job<T>, error: &EngineError) {
        self.publish(
            job.id(),
            NotificationEvent::Failure {
                reason: error.reason(),
                message: error.to_string(),
            },
        );
    }

    fn attach_progress_observer<T: Cacheable>(&self, job: &Job<T>) -> ProgressObserver {
        let job_id = job.id();
        let subscribers = Arc::clone(&self.subscribers);
        ProgressObserver::new(move |fraction| {
            broadcast(&subscribers, job_id, NotificationEvent::Progress { fraction });
        })
    }

    fn on_status<T: Cacheable>(&self, job: &Job<T>, status: JobStatus) {
        self.publish(job.id(), NotificationEvent::Status { status });
    }
}
