use std::path::PathBuf;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::block::BlockMeta;

/// Per-job settings handed to the compactor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionOptions {
    /// Directory for intermediate files of this job.
    pub temp_dir: PathBuf,
    /// Directory large source objects are downloaded to.
    pub source_dir: PathBuf,
    /// Objects up to this size are read into memory instead of downloaded.
    pub max_size_load_in_memory: u64,
}

/// Errors returned by a [`BlockCompactor`].
#[derive(Debug, Error)]
pub enum CompactError {
    /// The cancellation token fired before the merge finished.
    #[error("compaction cancelled")]
    Cancelled,
    /// The merge failed.
    #[error("compaction failed: {0}")]
    Failed(String),
    /// Local or object storage I/O failed.
    #[error("compaction io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CompactError {
    /// Returns `true` for [`CompactError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Merges input blocks into output blocks one level up.
///
/// Implementations must watch `cancel` and return [`CompactError::Cancelled`]
/// promptly once it fires.
pub trait BlockCompactor: Send + Sync {
    /// Compact `blocks`, returning the metadata of the written blocks.
    fn compact(
        &self,
        blocks: Vec<BlockMeta>,
        options: CompactionOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<Vec<BlockMeta>, CompactError>>;
}
