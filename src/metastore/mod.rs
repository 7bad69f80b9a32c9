//! Metastore: the replicated control plane for block metadata and compaction.
//!
//! Writes are expressed as [`Command`]s applied through a [`Consensus`]
//! implementation; reads are served from the local state machine.

/// Replicated commands and responses.
pub mod command;
/// Consensus seam and the single-node log.
pub mod raft;
/// Deterministic state machine.
pub mod state;

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use thiserror::Error;

pub use command::{
    AddBlockRequest, Command, CommandResponse, LogEntry, PollCompactionJobsRequest,
    PollCompactionJobsResponse, UpdateJobStatusRequest,
};
pub use raft::{Consensus, LocalLog};
pub use state::MetastoreState;

use crate::{
    block::BlockMeta,
    clock::Clock,
    compaction::{CompactionJob, CompactionJobStatus, CompactionStrategy},
    store::{KvStore, StoreError},
    worker::{MetastoreClient, PollError},
};

/// Errors surfaced by metastore operations.
#[derive(Debug, Error)]
pub enum MetastoreError {
    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A block id is not a ULID.
    #[error("invalid block id {0:?}")]
    InvalidBlockId(String),
    /// The state machine answered a command with the wrong response kind.
    #[error("unexpected response to {0} command")]
    UnexpectedResponse(&'static str),
    /// The consensus layer could not apply the command.
    #[error("consensus apply failed: {0}")]
    Apply(String),
}

/// Metastore configuration.
#[derive(Clone, Debug)]
pub struct MetastoreConfig {
    /// How long an assignment or renewal keeps a job owned.
    pub lease: Duration,
    /// Job formation policy.
    pub strategy: CompactionStrategy,
}

impl Default for MetastoreConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(15),
            strategy: CompactionStrategy::default(),
        }
    }
}

impl MetastoreConfig {
    /// Set the job lease duration. Workers renew at their poll interval, which
    /// should stay below half the lease.
    pub fn with_lease(self, lease: Duration) -> Self {
        Self { lease, ..self }
    }

    /// Set the compaction strategy.
    pub fn with_strategy(self, strategy: CompactionStrategy) -> Self {
        Self { strategy, ..self }
    }
}

/// Metastore service front.
#[derive(Debug)]
pub struct Metastore<S> {
    log: Arc<LocalLog<S>>,
}

impl<S> Clone for Metastore<S> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
        }
    }
}

impl<S: KvStore> Metastore<S> {
    /// Open a metastore over `store`, restoring whatever it already holds.
    pub fn open(
        config: MetastoreConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MetastoreError> {
        let state = Arc::new(MetastoreState::new(&config, store));
        let applied_index = state.restore()?;
        Ok(Self {
            log: Arc::new(LocalLog::resume(state, clock, applied_index)),
        })
    }

    /// Log the metastore applies commands through.
    pub fn log(&self) -> &LocalLog<S> {
        &self.log
    }

    /// Local state machine.
    pub fn state(&self) -> &MetastoreState<S> {
        self.log.state()
    }

    /// Record a new block, possibly forming a compaction job.
    pub fn add_block(&self, block: BlockMeta) -> Result<(), MetastoreError> {
        match self.log.apply(Command::AddBlock(AddBlockRequest { block }))? {
            (_, CommandResponse::AddBlock) => Ok(()),
            _ => Err(MetastoreError::UnexpectedResponse("add_block")),
        }
    }

    /// Apply worker status reports.
    pub fn update_job_status(
        &self,
        job_status_updates: Vec<CompactionJobStatus>,
    ) -> Result<(), MetastoreError> {
        let command = Command::UpdateJobStatus(UpdateJobStatusRequest { job_status_updates });
        match self.log.apply(command)? {
            (_, CommandResponse::UpdateJobStatus) => Ok(()),
            _ => Err(MetastoreError::UnexpectedResponse("update_job_status")),
        }
    }

    /// Apply status reports and lease up to `job_capacity` jobs.
    pub fn poll_compaction_jobs(
        &self,
        request: PollCompactionJobsRequest,
    ) -> Result<PollCompactionJobsResponse, MetastoreError> {
        match self.log.apply(Command::PollCompactionJobs(request))? {
            (_, CommandResponse::PollCompactionJobs(response)) => Ok(response),
            _ => Err(MetastoreError::UnexpectedResponse("poll_compaction_jobs")),
        }
    }

    /// Jobs formed and not yet completed successfully.
    pub fn get_compaction_jobs(&self) -> Vec<CompactionJob> {
        self.state().compaction_jobs()
    }

    /// Recorded blocks of `shard`.
    pub fn list_blocks(&self, shard: u32) -> Vec<BlockMeta> {
        self.state().list_blocks(shard)
    }
}

impl<S: KvStore + 'static> MetastoreClient for Metastore<S> {
    fn poll_compaction_jobs<'a>(
        &'a self,
        request: PollCompactionJobsRequest,
    ) -> BoxFuture<'a, Result<PollCompactionJobsResponse, PollError>> {
        Box::pin(async move {
            Metastore::<S>::poll_compaction_jobs(self, request).map_err(PollError::from)
        })
    }
}
