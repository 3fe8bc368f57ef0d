//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Logical requests accepted by `submit`.
    pub submitted: u64,
    /// Submissions or retries discarded because the engine was stopped.
    pub dropped: u64,
    pub succeeded: u64,
    /// Stale cache values served before a refresh.
    pub provisional: u64,
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Attempts abandoned after cancellation.
    pub cancelled: u64,
    /// Attempts that panicked inside a worker.
    pub panicked: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    provisional: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Submitted,
    Dropped,
    Succeeded,
    Provisional,
    Failed,
    Retried,
    Cancelled,
    Panicked,
}

impl StatsCounters {
    pub(crate) fn incr(&self, counter: Counter) {
        self.cell(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> EngineStats {
        let get = |counter| self.cell(counter).load(Ordering::Relaxed);
        EngineStats {
            submitted: get(Counter::Submitted),
            dropped: get(Counter::Dropped),
            succeeded: get(Counter::Succeeded),
            provisional: get(Counter::Provisional),
            failed: get(Counter::Failed),
            retried: get(Counter::Retried),
            cancelled: get(Counter::Cancelled),
            panicked: get(Counter::Panicked),
        }
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Submitted => &self.submitted,
            Counter::Dropped => &self.dropped,
            Counter::Succeeded => &self.succeeded,
            Counter::Provisional => &self.provisional,
            Counter::Failed => &self.failed,
            Counter::Retried => &self.retried,
            Counter::Cancelled => &self.cancelled,
            Counter::Panicked => &self.panicked,
        }
    }
}
