//! Commands replicated through the metastore log and their responses.

use serde::{Deserialize, Serialize};

use crate::{
    block::BlockMeta,
    compaction::{CompactionJob, CompactionJobStatus},
};

/// Record a newly written block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddBlockRequest {
    /// Block to record.
    pub block: BlockMeta,
}

/// Report job statuses without asking for work.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJobStatusRequest {
    /// Status reports, applied in order.
    pub job_status_updates: Vec<CompactionJobStatus>,
}

/// Report job statuses and ask for up to `job_capacity` new jobs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCompactionJobsRequest {
    /// Status reports, applied in order before assignment.
    pub job_status_updates: Vec<CompactionJobStatus>,
    /// Number of jobs the worker can take.
    pub job_capacity: u32,
}

/// Jobs assigned by a poll.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollCompactionJobsResponse {
    /// Leased jobs, at most the requested capacity.
    pub compaction_jobs: Vec<CompactionJob>,
}

/// State machine command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// See [`AddBlockRequest`].
    AddBlock(AddBlockRequest),
    /// See [`UpdateJobStatusRequest`].
    UpdateJobStatus(UpdateJobStatusRequest),
    /// See [`PollCompactionJobsRequest`].
    PollCompactionJobs(PollCompactionJobsRequest),
}

impl Command {
    /// Command name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddBlock(_) => "add_block",
            Self::UpdateJobStatus(_) => "update_job_status",
            Self::PollCompactionJobs(_) => "poll_compaction_jobs",
        }
    }
}

/// Result of applying a [`Command`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// The block was recorded, or was already known.
    AddBlock,
    /// Status reports were applied.
    UpdateJobStatus,
    /// Status reports were applied and jobs assigned.
    PollCompactionJobs(PollCompactionJobsResponse),
}

/// A command as appended to the log.
///
/// `appended_at_ms` is the only time source the state machine consults, and
/// `index` is the fencing token for any lease the command grants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub index: u64,
    /// Leader time when the entry was appended, in milliseconds.
    pub appended_at_ms: i64,
    /// Replicated command.
    pub command: Command,
}
