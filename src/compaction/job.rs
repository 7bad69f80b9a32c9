//! Compaction job records and the status reports exchanged with workers.

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::{block::BlockMeta, compaction::strategy::JobNaming};

/// Lifecycle status of a compaction job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompactionStatus {
    /// Not started, or outcome unknown (a cancelled job reports nothing).
    #[default]
    Unspecified,
    /// Leased to a worker.
    InProgress,
    /// Finished; output blocks are attached.
    Success,
    /// Finished with an error. Not retried.
    Failure,
}

impl CompactionStatus {
    /// `true` for statuses that retire the job.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Lowercase label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Durable record of one unit of compaction work.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJob {
    /// Deterministic name, `L{level}-S{shard}-{hash}`.
    pub name: String,
    /// Shard all input blocks belong to.
    pub shard: u32,
    /// Tenant of the block that triggered the job.
    pub tenant_id: String,
    /// Level of every input block. Outputs are written at `compaction_level + 1`.
    pub compaction_level: u32,
    /// Input blocks, in queue order.
    pub blocks: Vec<BlockMeta>,
    /// Current status.
    pub status: CompactionStatus,
    /// Fencing token of the current lease (log index of the assigning command).
    pub commit_index: u64,
    /// Absolute lease deadline in milliseconds; 0 until first assignment.
    pub lease_expires_at: i64,
}

impl CompactionJob {
    /// Form a job from queued blocks.
    pub fn new(
        shard: u32,
        tenant_id: impl Into<String>,
        compaction_level: u32,
        blocks: Vec<BlockMeta>,
        naming: JobNaming,
    ) -> Self {
        Self {
            name: job_name(compaction_level, shard, &blocks, naming),
            shard,
            tenant_id: tenant_id.into(),
            compaction_level,
            blocks,
            status: CompactionStatus::Unspecified,
            commit_index: 0,
            lease_expires_at: 0,
        }
    }

    /// Status report for this job carrying its current fencing token.
    pub fn status_update(&self, status: CompactionStatus) -> CompactionJobStatus {
        CompactionJobStatus {
            job_name: self.name.clone(),
            status,
            commit_index: self.commit_index,
            completed_job: None,
            shard: self.shard,
            tenant_id: self.tenant_id.clone(),
            compaction_level: self.compaction_level,
        }
    }
}

/// Deterministic job name for a set of blocks.
pub fn job_name(level: u32, shard: u32, blocks: &[BlockMeta], naming: JobNaming) -> String {
    let mut ids: Vec<&str> = blocks.iter().map(|block| block.id.as_str()).collect();
    if naming == JobNaming::SortedBlockIds {
        ids.sort_unstable();
    }
    let mut buf = String::with_capacity(ids.iter().map(|id| id.len()).sum());
    for id in ids {
        buf.push_str(id);
    }
    format!("L{level}-S{shard}-{}", XxHash64::oneshot(0, buf.as_bytes()))
}

/// Result attached to a successful job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedJob {
    /// Output blocks written by the worker.
    pub blocks: Vec<BlockMeta>,
}

/// Status report sent by a worker for a job it holds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionJobStatus {
    /// Job the report is about.
    pub job_name: String,
    /// Reported status.
    pub status: CompactionStatus,
    /// Fencing token the worker was issued with the job.
    pub commit_index: u64,
    /// Outputs, present for `Success`.
    pub completed_job: Option<CompletedJob>,
    /// Shard of the job.
    pub shard: u32,
    /// Tenant of the job.
    pub tenant_id: String,
    /// Level of the job inputs.
    pub compaction_level: u32,
}
