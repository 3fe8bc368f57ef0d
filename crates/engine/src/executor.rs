//! Priority executor.
//!
//! Work is tagged with an integer priority: higher runs sooner, FIFO within
//! the same priority. [`PriorityThreadPool`] is a fixed set of named worker
//! threads draining one shared priority queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::sync::lock;

/// Unit of work accepted by an executor.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("executor is shut down")]
    ShutDown,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Worker pool consuming priority-tagged work.
pub trait PriorityExecutor: Send + Sync {
    /// Queue `work`; the returned handle can withdraw it until it starts.
    fn submit(&self, priority: i32, work: WorkItem) -> Result<TaskHandle, ExecutorError>;

    /// Stop accepting work and discard what is queued. Running work finishes.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const FINISHED: u8 = 2;
const CANCELLED: u8 = 3;

/// Shared state of one submitted work item.
#[derive(Debug, Clone)]
pub struct TaskHandle(Arc<AtomicU8>);

impl TaskHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(QUEUED)))
    }

    /// Withdraw queued work. Returns `false` once it has started.
    pub fn cancel(&self) -> bool {
        self.transition(QUEUED, CANCELLED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == CANCELLED
    }

    pub fn is_finished(&self) -> bool {
        self.0.load(Ordering::Acquire) == FINISHED
    }

    /// Claim queued work for execution; `false` if it was cancelled.
    ///
    /// For executor implementations.
    pub fn try_start(&self) -> bool {
        self.transition(QUEUED, RUNNING)
    }

    /// For executor implementations.
    pub fn finish(&self) {
        self.0.store(FINISHED, Ordering::Release);
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct Queued {
    priority: i32,
    sequence: u64,
    handle: TaskHandle,
    work: WorkItem,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Higher priority first, then lower sequence (older) first
        match self.priority.cmp(&other.priority) {
            CmpOrdering::Equal => other.sequence.cmp(&self.sequence),
            other_ordering => other_ordering,
        }
    }
}

#[derive(Default)]
struct PoolState {
    queue: BinaryHeap<Queued>,
    sequence: u64,
    shutdown: bool,
}

#[derive(Default)]
struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size thread pool with a priority-ordered queue.
pub struct PriorityThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
}

impl PriorityThreadPool {
    /// Spawn `threads` workers named `{name}-{index}`.
    pub fn new(threads: usize, name: &str) -> Result<Self, ExecutorError> {
        let threads = threads.max(1);
        let shared = Arc::new(PoolShared::default());
        let mut workers = Vec::with_capacity(threads);

        for index in 0..threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shutdown_shared(&shared);
                    return Err(ExecutorError::Spawn(err.to_string()));
                }
            }
        }

        info!(threads, name, "priority thread pool started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            threads,
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Work waiting for a free worker.
    pub fn pending(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    /// Shut down and wait for the workers to exit.
    ///
    /// Must not be called from a worker thread of this pool; such a call
    /// skips that worker.
    pub fn join(&self) {
        self.shutdown();
        let workers = std::mem::take(&mut *lock(&self.workers));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("pool worker exited abnormally");
            }
        }
    }
}

impl PriorityExecutor for PriorityThreadPool {
    fn submit(&self, priority: i32, work: WorkItem) -> Result<TaskHandle, ExecutorError> {
        let handle = TaskHandle::new();
        {
            let mut state = lock(&self.shared.state);
            if state.shutdown {
                return Err(ExecutorError::ShutDown);
            }
            let sequence = state.sequence;
            state.sequence = state.sequence.wrapping_add(1);
            state.queue.push(Queued {
                priority,
                sequence,
                handle: handle.clone(),
                work,
            });
        }
        self.shared.available.notify_one();
        Ok(handle)
    }

    fn shutdown(&self) {
        shutdown_shared(&self.shared);
    }

    fn is_shutdown(&self) -> bool {
        lock(&self.shared.state).shutdown
    }
}

impl Drop for PriorityThreadPool {
    fn drop(&mut self) {
        shutdown_shared(&self.shared);
    }
}

impl core::fmt::Debug for PriorityThreadPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PriorityThreadPool")
            .field("threads", &self.threads)
            .field("pending", &self.pending())
            .finish()
    }
}

fn shutdown_shared(shared: &PoolShared) {
    let discarded = {
        let mut state = lock(&shared.state);
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let discarded: Vec<Queued> = state.queue.drain().collect();
        discarded
    };
    for item in &discarded {
        item.handle.cancel();
    }
    shared.available.notify_all();
    debug!(discarded = discarded.len(), "priority thread pool shut down");
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let item = {
            let mut state = lock(&shared.state);
            loop {
                if let Some(item) = state.queue.pop() {
                    break item;
                }
                if state.shutdown {
                    return;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
        };

        if !item.handle.try_start() {
            continue;
        }
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(item.work)) {
            error!(
                priority = item.priority,
                panic = %panic_message(panic.as_ref()),
                "work item panicked"
            );
        }
        item.handle.finish();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
