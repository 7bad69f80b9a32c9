use std::{path::PathBuf, time::Duration};

/// Compaction worker configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Maximum number of jobs held at once, running or waiting to start.
    pub job_capacity: usize,
    /// Objects up to this size are loaded into memory; larger ones are
    /// downloaded to the source directory first.
    pub small_object_size: u64,
    /// Root directory for in-flight compaction artifacts. Every job works in
    /// its own subdirectory.
    pub temp_dir: PathBuf,
    /// Interval between polls. Also the lease renewal interval, so it must
    /// stay below half the metastore lease.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_capacity: 3,
            small_object_size: 8 << 20,
            temp_dir: std::env::temp_dir().join("kiln-compactor"),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Set the job capacity.
    pub fn with_job_capacity(self, job_capacity: usize) -> Self {
        Self {
            job_capacity,
            ..self
        }
    }

    /// Set the in-memory object size threshold.
    pub fn with_small_object_size(self, small_object_size: u64) -> Self {
        Self {
            small_object_size,
            ..self
        }
    }

    /// Set the temporary directory root.
    pub fn with_temp_dir(self, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            ..self
        }
    }

    /// Set the poll interval.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }
}
