//! Per-shard compaction planning.
//!
//! Every shard owns a [`CompactionPlan`] holding the blocks that arrived but
//! are not part of a job yet, grouped by compaction level, and the jobs formed
//! so far. Planning is split in two phases so the caller can make the outcome
//! durable first: [`Planner::plan`] evaluates blocks against the strategy
//! without touching any plan, and [`Planner::commit`] applies the outcome once
//! the store accepted it.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    block::{total_size, BlockMeta},
    compaction::{
        job::{CompactionJob, CompactionStatus},
        strategy::CompactionStrategy,
    },
    observability::{log_debug, log_info},
};

/// What planning decided for a single block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The block is above the maximum compaction level and is not scheduled.
    Skipped(BlockMeta),
    /// The block waits in its level queue.
    Queued(BlockMeta),
    /// The block completed a job made of the whole level queue.
    Job(CompactionJob),
}

#[derive(Debug, Default)]
struct PlanState {
    queued_blocks_by_level: HashMap<u32, Vec<BlockMeta>>,
    jobs_by_name: HashMap<String, CompactionJob>,
}

/// Planning state of one shard.
#[derive(Debug, Default)]
pub(crate) struct CompactionPlan {
    state: Mutex<PlanState>,
}

impl CompactionPlan {
    fn queued(&self, level: u32) -> Vec<BlockMeta> {
        self.state
            .lock()
            .queued_blocks_by_level
            .get(&level)
            .cloned()
            .unwrap_or_default()
    }
}

/// Turns incoming blocks into compaction jobs.
#[derive(Debug)]
pub struct Planner {
    strategy: CompactionStrategy,
    plans: Mutex<HashMap<u32, Arc<CompactionPlan>>>,
}

impl Planner {
    /// Create a planner applying `strategy` to every shard.
    pub fn new(strategy: CompactionStrategy) -> Self {
        Self {
            strategy,
            plans: Mutex::new(HashMap::new()),
        }
    }

    /// Strategy in use.
    pub fn strategy(&self) -> &CompactionStrategy {
        &self.strategy
    }

    fn plan_for(&self, shard: u32) -> Arc<CompactionPlan> {
        Arc::clone(self.plans.lock().entry(shard).or_default())
    }

    /// Evaluate `blocks` in order without changing any plan.
    ///
    /// Blocks are simulated one after the other, so a batch can form several
    /// jobs, including jobs made of blocks queued earlier in the same batch.
    pub fn plan(&self, blocks: &[BlockMeta]) -> Vec<PlanOutcome> {
        let mut scratch: HashMap<(u32, u32), Vec<BlockMeta>> = HashMap::new();
        let mut outcomes = Vec::with_capacity(blocks.len());
        for block in blocks {
            let level = block.compaction_level;
            if level > self.strategy.max_compaction_level() {
                outcomes.push(PlanOutcome::Skipped(block.clone()));
                continue;
            }
            let queued = match scratch.entry((block.shard, level)) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.plan_for(block.shard).queued(level)),
            };
            queued.push(block.clone());
            if self.strategy.for_level(level).should_create_job(queued) {
                let blocks = std::mem::take(queued);
                outcomes.push(PlanOutcome::Job(CompactionJob::new(
                    block.shard,
                    block.tenant_id.clone(),
                    level,
                    blocks,
                    self.strategy.job_naming(),
                )));
            } else {
                outcomes.push(PlanOutcome::Queued(block.clone()));
            }
        }
        outcomes
    }

    /// Apply outcomes produced by [`Planner::plan`].
    pub fn commit(&self, outcomes: &[PlanOutcome]) {
        for outcome in outcomes {
            match outcome {
                PlanOutcome::Skipped(block) => {
                    log_info!(
                        component = "planner",
                        event = "block_skipped_max_level",
                        block = %block.id,
                        shard = block.shard,
                        level = block.compaction_level
                    );
                }
                PlanOutcome::Queued(block) => {
                    let plan = self.plan_for(block.shard);
                    let mut state = plan.state.lock();
                    let queued = state
                        .queued_blocks_by_level
                        .entry(block.compaction_level)
                        .or_default();
                    queued.push(block.clone());
                    log_debug!(
                        component = "planner",
                        event = "block_queued",
                        block = %block.id,
                        shard = block.shard,
                        tenant = %block.tenant_id,
                        level = block.compaction_level,
                        size = block.size,
                        queue_size = queued.len()
                    );
                }
                PlanOutcome::Job(job) => {
                    let plan = self.plan_for(job.shard);
                    let mut state = plan.state.lock();
                    let consumed: HashSet<&str> =
                        job.blocks.iter().map(|block| block.id.as_str()).collect();
                    if let Some(queued) = state.queued_blocks_by_level.get_mut(&job.compaction_level)
                    {
                        queued.retain(|block| !consumed.contains(block.id.as_str()));
                    }
                    state.jobs_by_name.insert(job.name.clone(), job.clone());
                    log_info!(
                        component = "planner",
                        event = "job_created",
                        job = %job.name,
                        blocks = job.blocks.len(),
                        blocks_bytes = total_size(&job.blocks),
                        shard = job.shard,
                        tenant = %job.tenant_id,
                        level = job.compaction_level
                    );
                }
            }
        }
    }

    /// Plan and commit a single block, returning the job it completed.
    pub fn add_for_compaction(&self, block: BlockMeta) -> Option<CompactionJob> {
        let outcomes = self.plan(std::slice::from_ref(&block));
        self.commit(&outcomes);
        outcomes.into_iter().find_map(|outcome| match outcome {
            PlanOutcome::Job(job) => Some(job),
            _ => None,
        })
    }

    /// Blocks waiting at `level` of `shard`, in arrival order.
    pub fn queued_blocks(&self, shard: u32, level: u32) -> Vec<BlockMeta> {
        match self.plans.lock().get(&shard) {
            Some(plan) => plan.queued(level),
            None => Vec::new(),
        }
    }

    /// Jobs formed and not yet completed successfully, across all shards.
    pub fn jobs(&self) -> Vec<CompactionJob> {
        let plans: Vec<Arc<CompactionPlan>> = self.plans.lock().values().cloned().collect();
        let mut jobs: Vec<CompactionJob> = plans
            .iter()
            .flat_map(|plan| {
                plan.state
                    .lock()
                    .jobs_by_name
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Record the terminal state of a job. Successful jobs are forgotten;
    /// failed ones stay visible with their final record.
    pub fn finish_job(&self, record: &CompactionJob) {
        let plan = self.plan_for(record.shard);
        let mut state = plan.state.lock();
        if record.status == CompactionStatus::Success {
            state.jobs_by_name.remove(&record.name);
        } else {
            state.jobs_by_name.insert(record.name.clone(), record.clone());
        }
    }

    /// Put back a block loaded from the queued-block index.
    pub fn restore_queued_block(&self, block: BlockMeta) {
        let plan = self.plan_for(block.shard);
        plan.state
            .lock()
            .queued_blocks_by_level
            .entry(block.compaction_level)
            .or_default()
            .push(block);
    }

    /// Put back a job loaded from the store.
    pub fn restore_job(&self, job: CompactionJob) {
        let plan = self.plan_for(job.shard);
        plan.state.lock().jobs_by_name.insert(job.name.clone(), job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::strategy::LevelStrategy;

    fn level0_blocks(shard: u32, n: usize) -> Vec<BlockMeta> {
        (0..n)
            .map(|_| BlockMeta::new(shard, 0, 52 << 10).with_tenant("tenant"))
            .collect()
    }

    #[test]
    fn tenth_block_forms_job() {
        let planner = Planner::new(CompactionStrategy::default());
        let blocks = level0_blocks(7, 10);
        for block in &blocks[..9] {
            assert!(planner.add_for_compaction(block.clone()).is_none());
        }
        assert_eq!(planner.queued_blocks(7, 0).len(), 9);

        let job = planner
            .add_for_compaction(blocks[9].clone())
            .expect("job formed");
        assert!(job.name.starts_with("L0-S7-"), "{}", job.name);
        assert_eq!(job.blocks, blocks);
        assert_eq!(job.compaction_level, 0);
        assert_eq!(job.status, CompactionStatus::Unspecified);
        assert!(planner.queued_blocks(7, 0).is_empty());
        assert_eq!(planner.jobs(), vec![job]);
    }

    #[test]
    fn plan_does_not_mutate_until_commit() {
        let planner = Planner::new(CompactionStrategy::default());
        let blocks = level0_blocks(1, 10);
        let outcomes = planner.plan(&blocks);
        assert_eq!(outcomes.len(), 10);
        assert!(matches!(outcomes[9], PlanOutcome::Job(_)));
        assert!(planner.queued_blocks(1, 0).is_empty());
        assert!(planner.jobs().is_empty());

        planner.commit(&outcomes);
        assert!(planner.queued_blocks(1, 0).is_empty());
        assert_eq!(planner.jobs().len(), 1);
    }

    #[test]
    fn batch_planning_sees_committed_queue() {
        let planner = Planner::new(CompactionStrategy::default());
        let blocks = level0_blocks(1, 12);
        for block in &blocks[..4] {
            planner.add_for_compaction(block.clone());
        }
        let outcomes = planner.plan(&blocks[4..]);
        let jobs: Vec<&CompactionJob> = outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                PlanOutcome::Job(job) => Some(job),
                _ => None,
            })
            .collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].blocks, blocks[..10].to_vec());
        planner.commit(&outcomes);
        assert_eq!(planner.queued_blocks(1, 0), blocks[10..].to_vec());
    }

    #[test]
    fn blocks_above_max_level_are_skipped() {
        let strategy = CompactionStrategy::default().with_max_compaction_level(2);
        let planner = Planner::new(strategy);
        let block = BlockMeta::new(1, 3, 1);
        assert_eq!(
            planner.plan(std::slice::from_ref(&block)),
            vec![PlanOutcome::Skipped(block.clone())]
        );
        assert!(planner.add_for_compaction(block).is_none());
        assert!(planner.queued_blocks(1, 3).is_empty());

        let at_max = BlockMeta::new(1, 2, 1);
        planner.add_for_compaction(at_max.clone());
        assert_eq!(planner.queued_blocks(1, 2), vec![at_max]);
    }

    #[test]
    fn shards_and_levels_plan_independently() {
        let strategy = CompactionStrategy::default().with_level(
            1,
            LevelStrategy {
                min_blocks: 2,
                max_blocks: 2,
                min_total_size_bytes: 0,
                max_total_size_bytes: u64::MAX,
            },
        );
        let planner = Planner::new(strategy);
        assert!(planner
            .add_for_compaction(BlockMeta::new(1, 1, 1))
            .is_none());
        assert!(planner
            .add_for_compaction(BlockMeta::new(2, 1, 1))
            .is_none());
        assert!(planner
            .add_for_compaction(BlockMeta::new(1, 0, 1))
            .is_none());
        let job = planner
            .add_for_compaction(BlockMeta::new(1, 1, 1))
            .expect("shard 1 level 1 job");
        assert!(job.name.starts_with("L1-S1-"));
        assert_eq!(planner.queued_blocks(2, 1).len(), 1);
        assert_eq!(planner.queued_blocks(1, 0).len(), 1);
    }

    #[test]
    fn replaying_blocks_forms_same_jobs() {
        let blocks = level0_blocks(3, 25);
        let names = |planner: &Planner| {
            blocks
                .iter()
                .filter_map(|block| planner.add_for_compaction(block.clone()))
                .map(|job| job.name)
                .collect::<Vec<_>>()
        };
        let first = names(&Planner::new(CompactionStrategy::default()));
        let second = names(&Planner::new(CompactionStrategy::default()));
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn finish_job_forgets_success_and_keeps_failure() {
        let planner = Planner::new(CompactionStrategy::default());
        let mut formed = Vec::new();
        for block in level0_blocks(1, 20) {
            formed.extend(planner.add_for_compaction(block));
        }
        assert_eq!(formed.len(), 2);
        let mut succeeded = formed[0].clone();
        succeeded.status = CompactionStatus::Success;
        planner.finish_job(&succeeded);
        let mut failed = formed[1].clone();
        failed.status = CompactionStatus::Failure;
        failed.commit_index = 9;
        planner.finish_job(&failed);
        let jobs = planner.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0], failed);
    }

    #[test]
    fn restore_rebuilds_plan_state() {
        let planner = Planner::new(CompactionStrategy::default());
        let blocks = level0_blocks(4, 10);
        for block in &blocks[..9] {
            planner.restore_queued_block(block.clone());
        }
        let job = planner
            .add_for_compaction(blocks[9].clone())
            .expect("restored queue completes the job");
        assert_eq!(job.blocks.len(), 10);

        let restored = Planner::new(CompactionStrategy::default());
        restored.restore_job(job.clone());
        assert_eq!(restored.jobs(), vec![job]);
    }
}
