//! Per-level policy deciding when accumulated blocks form a compaction job.

use std::collections::HashMap;

use crate::block::{total_size, BlockMeta};

/// Thresholds for a single compaction level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelStrategy {
    /// Block count that, together with `min_total_size_bytes`, forms a job.
    pub min_blocks: usize,
    /// Block count that forms a job on its own.
    pub max_blocks: usize,
    /// Accumulated bytes that, together with `min_blocks`, form a job.
    pub min_total_size_bytes: u64,
    /// Accumulated bytes that form a job on their own.
    pub max_total_size_bytes: u64,
}

impl LevelStrategy {
    /// Decide whether `blocks` should be turned into a job now.
    ///
    /// Both minimums met creates a job. Otherwise whichever minimum is met must
    /// also reach its maximum.
    pub fn should_create_job(&self, blocks: &[BlockMeta]) -> bool {
        let total_size_bytes = total_size(blocks);
        let enough_blocks = blocks.len() >= self.min_blocks;
        let enough_data = total_size_bytes >= self.min_total_size_bytes;
        match (enough_blocks, enough_data) {
            (true, true) => true,
            (true, false) => blocks.len() >= self.max_blocks,
            (false, true) => total_size_bytes >= self.max_total_size_bytes,
            (false, false) => false,
        }
    }
}

/// How the content hash of a job name is computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobNaming {
    /// Hash block ids in lexicographic order; independent of arrival order.
    #[default]
    SortedBlockIds,
    /// Hash block ids in the order they were queued.
    QueueOrder,
}

/// Compaction policy for every level.
#[derive(Clone, Debug)]
pub struct CompactionStrategy {
    levels: HashMap<u32, LevelStrategy>,
    default_strategy: LevelStrategy,
    max_compaction_level: u32,
    job_naming: JobNaming,
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        let mut levels = HashMap::new();
        levels.insert(
            0,
            LevelStrategy {
                min_blocks: 10,
                max_blocks: 20,
                min_total_size_bytes: 512 << 10,
                max_total_size_bytes: 2 << 20,
            },
        );
        Self {
            levels,
            // Levels above 0 compact every ten blocks regardless of size.
            default_strategy: LevelStrategy {
                min_blocks: 10,
                max_blocks: 10,
                min_total_size_bytes: 0,
                max_total_size_bytes: u64::MAX,
            },
            max_compaction_level: 10,
            job_naming: JobNaming::default(),
        }
    }
}

impl CompactionStrategy {
    /// Override the thresholds of one level.
    pub fn with_level(mut self, level: u32, strategy: LevelStrategy) -> Self {
        self.levels.insert(level, strategy);
        self
    }

    /// Thresholds for levels without an explicit entry.
    pub fn with_default_strategy(self, default_strategy: LevelStrategy) -> Self {
        Self {
            default_strategy,
            ..self
        }
    }

    /// Highest level that is still compacted.
    pub fn with_max_compaction_level(self, max_compaction_level: u32) -> Self {
        Self {
            max_compaction_level,
            ..self
        }
    }

    /// Select how job names hash their block ids.
    pub fn with_job_naming(self, job_naming: JobNaming) -> Self {
        Self { job_naming, ..self }
    }

    /// Thresholds applied to `level`.
    pub fn for_level(&self, level: u32) -> &LevelStrategy {
        self.levels.get(&level).unwrap_or(&self.default_strategy)
    }

    /// Highest level that is still compacted.
    pub fn max_compaction_level(&self) -> u32 {
        self.max_compaction_level
    }

    /// Job naming mode.
    pub fn job_naming(&self) -> JobNaming {
        self.job_naming
    }
}
