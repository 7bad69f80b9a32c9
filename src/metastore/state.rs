//! Replicated metastore state machine.
//!
//! Every replica applies the same log entries in the same order. Entries carry
//! their own timestamp and index, so lease deadlines and fencing tokens come
//! out identical everywhere. Each command first commits its durable changes
//! and only then touches the planner, the queue and the block index; a failed
//! write leaves all in-memory state as it was.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    block::BlockMeta,
    compaction::{
        CompactionJob, CompactionJobStatus, CompactionStatus, JobQueue, PlanOutcome, Planner,
    },
    metastore::{
        command::{
            AddBlockRequest, Command, CommandResponse, LogEntry, PollCompactionJobsResponse,
        },
        MetastoreConfig, MetastoreError,
    },
    observability::{log_debug, log_error, log_info, log_warn},
    store::{Bucket, Key, KvStore, StoreError, Transaction},
};

/// Entry of the queued-block index.
///
/// `index` and `position` record where the block entered its level queue so a
/// restore rebuilds the queue in arrival order.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueuedBlock {
    index: u64,
    position: usize,
    block: BlockMeta,
}

fn block_key(block: &BlockMeta) -> Key {
    Key::new(Bucket::BlockMetadata, block.shard, "", block.id.as_str())
}

fn queued_block_key(block: &BlockMeta) -> Key {
    Key::new(
        Bucket::CompactionBlockQueue,
        block.shard,
        block.tenant_id.as_str(),
        block.id.as_str(),
    )
}

fn job_key(job: &CompactionJob) -> Key {
    Key::new(
        Bucket::CompactionJobs,
        job.shard,
        job.tenant_id.as_str(),
        job.name.as_str(),
    )
}

/// Stage the durable side of planning outcomes.
fn persist_outcomes(
    tx: &mut Transaction<'_>,
    outcomes: &[PlanOutcome],
    index: u64,
) -> Result<(), StoreError> {
    for (position, outcome) in outcomes.iter().enumerate() {
        match outcome {
            PlanOutcome::Skipped(_) => {}
            PlanOutcome::Queued(block) => {
                let queued = QueuedBlock {
                    index,
                    position,
                    block: block.clone(),
                };
                tx.put_json(queued_block_key(block), &queued)?;
            }
            PlanOutcome::Job(job) => {
                for block in &job.blocks {
                    tx.delete(queued_block_key(block));
                }
                tx.put_json(job_key(job), job)?;
            }
        }
    }
    Ok(())
}

/// Change decided for one status report.
enum StatusChange {
    Renew {
        record: CompactionJob,
        token: u64,
    },
    Complete {
        job: CompactionJob,
        token: u64,
        outputs: Vec<BlockMeta>,
    },
    Fail {
        record: CompactionJob,
        token: u64,
    },
}

impl StatusChange {
    fn job_name(&self) -> &str {
        match self {
            Self::Renew { record, .. } | Self::Fail { record, .. } => &record.name,
            Self::Complete { job, .. } => &job.name,
        }
    }
}

/// Queue records as they were before a command touched them.
///
/// A command whose writes are rejected puts these back, so the queue ends up
/// exactly as the command found it.
#[derive(Default)]
struct QueueUndo {
    seen: HashSet<String>,
    previous: Vec<CompactionJob>,
    added: Vec<String>,
}

impl QueueUndo {
    /// Remember `job` unless an earlier record of the same name is held.
    fn capture(&mut self, job: Option<CompactionJob>) {
        if let Some(job) = job {
            if self.seen.insert(job.name.clone()) {
                self.previous.push(job);
            }
        }
    }

    fn enqueued(&mut self, name: &str) {
        self.seen.insert(name.to_string());
        self.added.push(name.to_string());
    }

    fn rollback(self, queue: &JobQueue) {
        for name in &self.added {
            queue.evict(name, u64::MAX);
        }
        queue.restore(self.previous);
    }
}

/// Durable block metadata, compaction plans and the job queue.
pub struct MetastoreState<S> {
    store: Arc<S>,
    planner: Planner,
    queue: JobQueue,
    blocks: RwLock<HashMap<u32, BTreeMap<String, BlockMeta>>>,
    apply_lock: Mutex<()>,
}

impl<S: KvStore> MetastoreState<S> {
    /// Create an empty state machine writing to `store`.
    pub fn new(config: &MetastoreConfig, store: Arc<S>) -> Self {
        Self {
            store,
            planner: Planner::new(config.strategy.clone()),
            queue: JobQueue::new(config.lease),
            blocks: RwLock::new(HashMap::new()),
            apply_lock: Mutex::new(()),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Compaction planner.
    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Live job queue.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Apply one log entry.
    pub fn apply(&self, entry: &LogEntry) -> Result<CommandResponse, MetastoreError> {
        match &entry.command {
            Command::AddBlock(request) => {
                self.apply_add_block(entry.index, request)?;
                Ok(CommandResponse::AddBlock)
            }
            Command::UpdateJobStatus(request) => {
                self.apply_reports(
                    entry.index,
                    entry.appended_at_ms,
                    &request.job_status_updates,
                    0,
                )?;
                Ok(CommandResponse::UpdateJobStatus)
            }
            Command::PollCompactionJobs(request) => {
                let compaction_jobs = self.apply_reports(
                    entry.index,
                    entry.appended_at_ms,
                    &request.job_status_updates,
                    request.job_capacity,
                )?;
                Ok(CommandResponse::PollCompactionJobs(
                    PollCompactionJobsResponse { compaction_jobs },
                ))
            }
        }
    }

    fn apply_add_block(&self, index: u64, request: &AddBlockRequest) -> Result<(), MetastoreError> {
        let block = &request.block;
        if !block.has_valid_id() {
            return Err(MetastoreError::InvalidBlockId(block.id.clone()));
        }
        log_info!(
            component = "metastore",
            event = "add_block",
            block = %block.id,
            shard = block.shard,
            tenant = %block.tenant_id,
            level = block.compaction_level
        );

        let _guard = self.apply_lock.lock();
        let planned = self.store.update(|tx| {
            let key = block_key(block);
            if tx.get(&key).is_some() {
                return Ok(None);
            }
            tx.put_json(key, block)?;
            let outcomes = self.planner.plan(std::slice::from_ref(block));
            persist_outcomes(tx, &outcomes, index)?;
            Ok(Some(outcomes))
        });
        let outcomes = match planned {
            Ok(Some(outcomes)) => outcomes,
            Ok(None) => {
                log_debug!(
                    component = "metastore",
                    event = "block_already_recorded",
                    block = %block.id
                );
                return Ok(());
            }
            Err(error) => {
                log_error!(
                    component = "metastore",
                    event = "add_block_failed",
                    block = %block.id,
                    error = %error
                );
                return Err(error.into());
            }
        };

        self.record_blocks(std::slice::from_ref(block));
        self.commit_outcomes(&outcomes);
        Ok(())
    }

    /// Apply status reports, then lease up to `capacity` jobs.
    ///
    /// Everything the command changes goes into one store transaction. Queue
    /// changes made while building it are undone if the store rejects it, and
    /// the planner and block index are only touched after it commits.
    fn apply_reports(
        &self,
        index: u64,
        now: i64,
        updates: &[CompactionJobStatus],
        capacity: u32,
    ) -> Result<Vec<CompactionJob>, MetastoreError> {
        let _guard = self.apply_lock.lock();
        let changes = self.plan_status_changes(now, updates);
        if changes.is_empty() && capacity == 0 {
            return Ok(Vec::new());
        }

        let mut undo = QueueUndo::default();
        for change in &changes {
            undo.capture(self.queue.job(change.job_name()));
        }
        self.apply_lease_changes(&changes, now);

        let committed = self.store.update(|tx| {
            let (outputs, outcomes) = self.stage_status_changes(tx, &changes, index)?;
            // Jobs formed from fresh outputs can be handed out right away.
            for outcome in &outcomes {
                if let PlanOutcome::Job(job) = outcome {
                    if self.queue.enqueue(job.clone()) {
                        undo.enqueued(&job.name);
                    }
                }
            }
            let mut assigned = Vec::new();
            for _ in 0..capacity {
                let Some(root) = self.queue.peek() else {
                    break;
                };
                let Some(job) = self.queue.dequeue(now, index) else {
                    break;
                };
                undo.capture(Some(root));
                tx.put_json(job_key(&job), &job)?;
                assigned.push(job);
            }
            Ok((outputs, outcomes, assigned))
        });
        let (outputs, outcomes, assigned) = match committed {
            Ok(committed) => committed,
            Err(error) => {
                log_error!(
                    component = "metastore",
                    event = "job_reports_rejected",
                    index,
                    updates = updates.len(),
                    capacity,
                    error = %error
                );
                undo.rollback(&self.queue);
                return Err(error.into());
            }
        };

        self.finish_status_changes(&changes);
        self.record_blocks(&outputs);
        self.planner.commit(&outcomes);
        for job in &assigned {
            log_info!(
                component = "metastore",
                event = "job_assigned",
                job = %job.name,
                shard = job.shard,
                tenant = %job.tenant_id,
                level = job.compaction_level,
                token = job.commit_index,
                lease_expires_at = job.lease_expires_at
            );
        }
        Ok(assigned)
    }

    /// Decide what each report changes; reports from superseded owners and
    /// reports about unknown jobs are dropped.
    fn plan_status_changes(&self, now: i64, updates: &[CompactionJobStatus]) -> Vec<StatusChange> {
        let mut retired = HashSet::new();
        let mut changes = Vec::new();
        for update in updates {
            if retired.contains(update.job_name.as_str()) {
                continue;
            }
            let Some(job) = self.queue.job(&update.job_name) else {
                log_debug!(
                    component = "metastore",
                    event = "status_for_unknown_job",
                    job = %update.job_name,
                    status = update.status.as_str()
                );
                continue;
            };
            if update.status == CompactionStatus::Unspecified {
                continue;
            }
            let token = update.commit_index;
            if !self.queue.peek_evict(&job.name, token) {
                log_debug!(
                    component = "metastore",
                    event = "stale_status_ignored",
                    job = %job.name,
                    status = update.status.as_str(),
                    token,
                    current_token = job.commit_index
                );
                continue;
            }
            match update.status {
                CompactionStatus::InProgress => {
                    let mut record = job;
                    record.status = CompactionStatus::InProgress;
                    record.commit_index = token;
                    record.lease_expires_at = now.saturating_add(self.queue.lease_ms());
                    changes.push(StatusChange::Renew { record, token });
                }
                CompactionStatus::Success => {
                    retired.insert(update.job_name.as_str());
                    let outputs = update
                        .completed_job
                        .as_ref()
                        .map(|completed| completed.blocks.clone())
                        .unwrap_or_default();
                    changes.push(StatusChange::Complete {
                        job,
                        token,
                        outputs,
                    });
                }
                CompactionStatus::Failure => {
                    retired.insert(update.job_name.as_str());
                    let mut record = job;
                    record.status = CompactionStatus::Failure;
                    record.commit_index = token;
                    changes.push(StatusChange::Fail { record, token });
                }
                CompactionStatus::Unspecified => {}
            }
        }
        changes
    }

    /// Stage the durable side of status changes: renewed and failed records,
    /// and for completed jobs the removal of the job and its inputs plus the
    /// outputs and whatever planning them produces.
    fn stage_status_changes(
        &self,
        tx: &mut Transaction<'_>,
        changes: &[StatusChange],
        index: u64,
    ) -> Result<(Vec<BlockMeta>, Vec<PlanOutcome>), StoreError> {
        let mut outputs = Vec::new();
        for change in changes {
            match change {
                StatusChange::Renew { record, .. } | StatusChange::Fail { record, .. } => {
                    tx.put_json(job_key(record), record)?;
                }
                StatusChange::Complete {
                    job, outputs: new, ..
                } => {
                    tx.delete(job_key(job));
                    for block in &job.blocks {
                        tx.delete(block_key(block));
                    }
                    for block in new {
                        if !block.has_valid_id() {
                            log_warn!(
                                component = "metastore",
                                event = "invalid_output_block",
                                job = %job.name,
                                block = %block.id
                            );
                            continue;
                        }
                        let key = block_key(block);
                        if tx.get(&key).is_some() {
                            continue;
                        }
                        tx.put_json(key, block)?;
                        outputs.push(block.clone());
                    }
                }
            }
        }
        let outcomes = self.planner.plan(&outputs);
        persist_outcomes(tx, &outcomes, index)?;
        Ok((outputs, outcomes))
    }

    fn apply_lease_changes(&self, changes: &[StatusChange], now: i64) {
        for change in changes {
            match change {
                StatusChange::Renew { record, token } => {
                    self.queue.update(&record.name, now, *token);
                }
                StatusChange::Complete { job, token, .. } => {
                    self.queue.evict(&job.name, *token);
                }
                StatusChange::Fail { record, token } => {
                    self.queue.evict(&record.name, *token);
                }
            }
        }
    }

    fn finish_status_changes(&self, changes: &[StatusChange]) {
        for change in changes {
            match change {
                StatusChange::Renew { .. } => {}
                StatusChange::Complete { job, .. } => {
                    let mut finished = job.clone();
                    finished.status = CompactionStatus::Success;
                    self.planner.finish_job(&finished);
                    self.forget_blocks(&job.blocks);
                    log_info!(
                        component = "metastore",
                        event = "job_completed",
                        job = %job.name,
                        shard = job.shard,
                        tenant = %job.tenant_id,
                        level = job.compaction_level,
                        input_blocks = job.blocks.len()
                    );
                }
                StatusChange::Fail { record, .. } => {
                    self.planner.finish_job(record);
                    log_warn!(
                        component = "metastore",
                        event = "job_failed",
                        job = %record.name,
                        shard = record.shard,
                        tenant = %record.tenant_id,
                        level = record.compaction_level
                    );
                }
            }
        }
    }

    fn commit_outcomes(&self, outcomes: &[PlanOutcome]) {
        self.planner.commit(outcomes);
        for outcome in outcomes {
            if let PlanOutcome::Job(job) = outcome {
                if !self.queue.enqueue(job.clone()) {
                    log_debug!(
                        component = "metastore",
                        event = "job_already_queued",
                        job = %job.name
                    );
                }
            }
        }
    }

    fn record_blocks(&self, blocks: &[BlockMeta]) {
        let mut index = self.blocks.write();
        for block in blocks {
            index
                .entry(block.shard)
                .or_default()
                .insert(block.id.clone(), block.clone());
        }
    }

    fn forget_blocks(&self, blocks: &[BlockMeta]) {
        let mut index = self.blocks.write();
        for block in blocks {
            if let Some(shard) = index.get_mut(&block.shard) {
                shard.remove(&block.id);
            }
        }
    }

    /// Load blocks, queued blocks and jobs from the store into a fresh state.
    ///
    /// Live jobs keep the fencing token and lease deadline they were persisted
    /// with. Failed jobs stay listed but are not queued.
    ///
    /// Returns the highest log index found in the restored records; a log
    /// resuming over this state must continue above it.
    pub fn restore(&self) -> Result<u64, MetastoreError> {
        let _guard = self.apply_lock.lock();
        let (blocks, mut queued, jobs) = self.store.view(|tx| {
            Ok((
                tx.scan_json::<BlockMeta>(Bucket::BlockMetadata, None)?,
                tx.scan_json::<QueuedBlock>(Bucket::CompactionBlockQueue, None)?,
                tx.scan_json::<CompactionJob>(Bucket::CompactionJobs, None)?,
            ))
        })?;

        self.record_blocks(&blocks);
        queued.sort_by_key(|queued| (queued.index, queued.position));
        let queued_blocks = queued.len();
        let mut applied_index = queued.iter().map(|queued| queued.index).max().unwrap_or(0);
        for queued in queued {
            self.planner.restore_queued_block(queued.block);
        }
        let mut live_jobs = 0;
        for job in &jobs {
            applied_index = applied_index.max(job.commit_index);
            self.planner.restore_job(job.clone());
            if !job.status.is_terminal() {
                self.queue.put_job(job.clone());
                live_jobs += 1;
            }
        }
        self.queue.rebuild();

        log_info!(
            component = "metastore",
            event = "state_restored",
            blocks = blocks.len(),
            queued_blocks,
            jobs = jobs.len(),
            live_jobs,
            applied_index
        );
        Ok(applied_index)
    }

    /// Jobs formed and not yet completed successfully, with their current lease.
    pub fn compaction_jobs(&self) -> Vec<CompactionJob> {
        self.planner
            .jobs()
            .into_iter()
            .map(|job| self.queue.job(&job.name).unwrap_or(job))
            .collect()
    }

    /// Recorded blocks of `shard`, ordered by id.
    pub fn list_blocks(&self, shard: u32) -> Vec<BlockMeta> {
        self.blocks
            .read()
            .get(&shard)
            .map(|blocks| blocks.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl<S> std::fmt::Debug for MetastoreState<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetastoreState")
            .field("planner", &self.planner)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
