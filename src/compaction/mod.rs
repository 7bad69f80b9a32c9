//! Compaction scheduling: when blocks form jobs and who runs them.
//!
//! The planner groups incoming blocks per shard and level and applies the
//! strategy; the queue hands the resulting jobs out to workers under leases
//! guarded by fencing tokens.

/// Index-tracking binary heap backing the job queue.
mod heap;
/// Job records and worker status reports.
pub mod job;
/// Per-shard planning of compaction jobs.
pub mod planner;
/// Lease-based priority queue of live jobs.
pub mod queue;
/// Per-level job formation policy.
pub mod strategy;

pub use job::{job_name, CompactionJob, CompactionJobStatus, CompactionStatus, CompletedJob};
pub use planner::{PlanOutcome, Planner};
pub use queue::JobQueue;
pub use strategy::{CompactionStrategy, JobNaming, LevelStrategy};
