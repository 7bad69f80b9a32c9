#![deny(missing_docs)]
//! Compaction scheduling for an object-storage profiling database.
//!
//! Ingesters write small immutable blocks and register them with the
//! metastore. The metastore's planner groups blocks per shard and level into
//! compaction jobs, and a lease-based queue hands those jobs to stateless
//! workers that poll for work, merge the blocks, and report the outputs back.
//!
//! Every metastore mutation is a [`metastore::Command`] applied in log order,
//! stamped with the log index and the time it was appended, so replicas that
//! replay the same log reach the same state.

/// Block metadata and section layout.
pub mod block;

/// Time sources.
pub mod clock;

/// Job planning, strategy and the leased job queue.
pub mod compaction;

/// Replicated state machine and its service front.
pub mod metastore;

mod observability;

/// Durable key-value storage.
pub mod store;

/// Pull-based compaction worker.
pub mod worker;

pub use crate::{
    block::{BlockMeta, TenantService},
    clock::{Clock, ManualClock, SystemClock},
    compaction::{
        CompactionJob, CompactionJobStatus, CompactionStatus, CompactionStrategy, CompletedJob,
        JobNaming, LevelStrategy,
    },
    metastore::{Metastore, MetastoreConfig, MetastoreError},
    store::{KvStore, MemoryStore, StoreError},
    worker::{BlockCompactor, MetastoreClient, Worker, WorkerConfig},
};
