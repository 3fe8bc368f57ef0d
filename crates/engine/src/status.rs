//! Job execution status.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Where a job is in its current attempt.
///
/// Within one attempt the status only moves forward through this sequence.
/// A scheduled retry (or an abandoned attempt) puts it back to `Created`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not running: fresh, waiting for a retry, or abandoned after cancellation.
    Created = 0,
    ReadingFromCache = 1,
    LoadingFromNetwork = 2,
    WritingToCache = 3,
    Complete = 4,
    Failed = 5,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self,
            JobStatus::ReadingFromCache | JobStatus::LoadingFromNetwork | JobStatus::WritingToCache
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::ReadingFromCache => "reading_from_cache",
            JobStatus::LoadingFromNetwork => "loading_from_network",
            JobStatus::WritingToCache => "writing_to_cache",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => JobStatus::ReadingFromCache,
            2 => JobStatus::LoadingFromNetwork,
            3 => JobStatus::WritingToCache,
            4 => JobStatus::Complete,
            5 => JobStatus::Failed,
            _ => JobStatus::Created,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free status cell shared between the engine and observers.
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: JobStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> JobStatus {
        JobStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, status: JobStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}
