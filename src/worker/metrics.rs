//! Compaction worker counters.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Output blocks were written.
    Success,
    /// The compactor returned an error.
    Failure,
    /// The worker shut down before the job finished.
    Cancelled,
}

impl JobOutcome {
    /// Lowercase label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerMetricsSnapshot {
    /// Successful poll round trips.
    pub polls: u64,
    /// Poll round trips that failed.
    pub poll_failures: u64,
    /// Jobs received from the metastore.
    pub jobs_assigned: u64,
    /// Status reports acknowledged by the metastore.
    pub status_updates_sent: u64,
    /// Jobs currently running.
    pub jobs_in_progress: u64,
    /// Jobs that produced output blocks.
    pub jobs_succeeded: u64,
    /// Jobs the compactor failed.
    pub jobs_failed: u64,
    /// Jobs interrupted by shutdown.
    pub jobs_cancelled: u64,
    /// Total run time of finished jobs (milliseconds).
    pub job_duration_ms_total: u64,
}

/// Shared worker counters.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    polls: AtomicU64,
    poll_failures: AtomicU64,
    jobs_assigned: AtomicU64,
    status_updates_sent: AtomicU64,
    jobs_in_progress: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    job_duration_ms_total: AtomicU64,
}

impl WorkerMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_poll(&self, status_updates: usize, assigned: usize) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.status_updates_sent
            .fetch_add(status_updates as u64, Ordering::Relaxed);
        self.jobs_assigned
            .fetch_add(assigned as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_poll_failure(&self) {
        self.poll_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_job_started(&self) {
        self.jobs_in_progress.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_job_finished(&self, outcome: JobOutcome, elapsed: Duration) {
        let _ = self
            .jobs_in_progress
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
        let counter = match outcome {
            JobOutcome::Success => &self.jobs_succeeded,
            JobOutcome::Failure => &self.jobs_failed,
            JobOutcome::Cancelled => &self.jobs_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.job_duration_ms_total
            .fetch_add(duration_to_millis(elapsed), Ordering::Relaxed);
    }

    /// Snapshot all counters.
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            jobs_assigned: self.jobs_assigned.load(Ordering::Relaxed),
            status_updates_sent: self.status_updates_sent.load(Ordering::Relaxed),
            jobs_in_progress: self.jobs_in_progress.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            job_duration_ms_total: self.job_duration_ms_total.load(Ordering::Relaxed),
        }
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
