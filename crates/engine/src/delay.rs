//! Bounded delay queue.
//!
//! Retries wait here instead of on a pool worker. One timer thread sleeps
//! until the earliest deadline and runs the due work inline, so scheduled
//! work must be short (the engine only re-enqueues the job).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error};

use crate::executor::{WorkItem, panic_message};
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelayError {
    #[error("delay queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },
    #[error("delay queue is shut down")]
    ShutDown,
    #[error("delay of {0:?} is out of range")]
    OutOfRange(Duration),
    #[error("failed to spawn timer thread: {0}")]
    Spawn(String),
}

struct Delayed {
    due: Instant,
    sequence: u64,
    work: WorkItem,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Earliest deadline on top of the max-heap.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct DelayState {
    entries: BinaryHeap<Delayed>,
    sequence: u64,
    shutdown: bool,
}

#[derive(Default)]
struct DelayShared {
    state: Mutex<DelayState>,
    wake: Condvar,
}

/// Runs work after a delay, holding at most `capacity` pending items.
pub struct DelayQueue {
    shared: Arc<DelayShared>,
    capacity: usize,
}

impl DelayQueue {
    pub fn new(capacity: usize, name: &str) -> Result<Self, DelayError> {
        let shared = Arc::new(DelayShared::default());
        let timer_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&timer_shared))
            .map_err(|e| DelayError::Spawn(e.to_string()))?;

        Ok(Self {
            shared,
            capacity: capacity.max(1),
        })
    }

    /// Run `work` on the timer thread once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, work: WorkItem) -> Result<(), DelayError> {
        let due = Instant::now()
            .checked_add(delay)
            .ok_or(DelayError::OutOfRange(delay))?;
        {
            let mut state = lock(&self.shared.state);
            if state.shutdown {
                return Err(DelayError::ShutDown);
            }
            if state.entries.len() >= self.capacity {
                return Err(DelayError::QueueFull {
                    capacity: self.capacity,
                });
            }
            let sequence = state.sequence;
            state.sequence = state.sequence.wrapping_add(1);
            state.entries.push(Delayed {
                due,
                sequence,
                work,
            });
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Drop pending work and stop the timer thread.
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = lock(&self.shared.state);
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            std::mem::take(&mut state.entries)
        };
        self.shared.wake.notify_all();
        debug!(discarded = discarded.len(), "delay queue shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.shared.state).shutdown
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for DelayQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl core::fmt::Debug for DelayQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DelayQueue")
            .field("capacity", &self.capacity)
            .field("pending", &self.len())
            .finish()
    }
}

fn timer_loop(shared: &DelayShared) {
    let mut state = lock(&shared.state);
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let wait = match state.entries.peek().map(|next| next.due) {
            None => None,
            Some(due) if due <= now => {
                if let Some(entry) = state.entries.pop() {
                    drop(state);
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(entry.work)) {
                        error!(panic = %panic_message(panic.as_ref()), "delayed work panicked");
                    }
                    state = lock(&shared.state);
                }
                continue;
            }
            Some(due) => Some(due - now),
        };

        state = match wait {
            None => shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                shared
                    .wake
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn runs_work_after_the_delay() {
        let queue = DelayQueue::new(8, "test-delay").unwrap();
        let (tx, rx) = mpsc::channel();
        let scheduled = Instant::now();

        queue
            .schedule(
                Duration::from_millis(40),
                Box::new(move || tx.send(Instant::now()).unwrap()),
            )
            .unwrap();

        let fired = rx.recv_timeout(WAIT).unwrap();
        assert!(fired.duration_since(scheduled) >= Duration::from_millis(40));
        assert!(queue.is_empty());
    }

    #[test]
    fn earliest_deadline_runs_first() {
        let queue = DelayQueue::new(8, "test-delay").unwrap();
        let (tx, rx) = mpsc::channel();

        for (label, ms) in [("late", 120), ("early", 20), ("middle", 60)] {
            let tx = tx.clone();
            queue
                .schedule(
                    Duration::from_millis(ms),
                    Box::new(move || tx.send(label).unwrap()),
                )
                .unwrap();
        }

        let order: Vec<_> = (0..3).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        assert_eq!(order, vec!["early", "middle", "late"]);
    }

    #[test]
    fn rejects_beyond_capacity() {
        let queue = DelayQueue::new(1, "test-delay").unwrap();
        queue.schedule(Duration::from_secs(60), Box::new(|| {})).unwrap();

        let err = queue
            .schedule(Duration::from_secs(60), Box::new(|| {}))
            .unwrap_err();
        assert_eq!(err, DelayError::QueueFull { capacity: 1 });
    }

    #[test]
    fn unrepresentable_delay_is_rejected() {
        let queue = DelayQueue::new(4, "test-delay").unwrap();
        assert_eq!(
            queue.schedule(Duration::MAX, Box::new(|| {})).unwrap_err(),
            DelayError::OutOfRange(Duration::MAX)
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn shutdown_discards_pending_work() {
        let queue = DelayQueue::new(4, "test-delay").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        queue
            .schedule(
                Duration::from_millis(30),
                Box::new(move || tx.send(()).unwrap()),
            )
            .unwrap();

        queue.shutdown();

        assert!(queue.is_shutdown());
        assert!(queue.is_empty());
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert_eq!(
            queue.schedule(Duration::ZERO, Box::new(|| {})).unwrap_err(),
            DelayError::ShutDown
        );
    }

    #[test]
    fn panicking_work_keeps_the_timer_alive() {
        let queue = DelayQueue::new(4, "test-delay").unwrap();
        queue.schedule(Duration::ZERO, Box::new(|| panic!("boom"))).unwrap();

        let (tx, rx) = mpsc::channel();
        queue
            .schedule(
                Duration::from_millis(10),
                Box::new(move || tx.send(()).unwrap()),
            )
            .unwrap();

        assert!(rx.recv_timeout(WAIT).is_ok());
    }
}
