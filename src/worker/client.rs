use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::metastore::{MetastoreError, PollCompactionJobsRequest, PollCompactionJobsResponse};

/// Errors returned by a poll round trip.
#[derive(Debug, Error)]
pub enum PollError {
    /// The request did not reach the metastore, or the reply was lost.
    #[error("metastore transport error: {0}")]
    Transport(String),
    /// The metastore rejected the request.
    #[error(transparent)]
    Metastore(#[from] MetastoreError),
}

/// Connection from a worker to the metastore.
pub trait MetastoreClient: Send + Sync {
    /// Report job statuses and ask for new jobs.
    fn poll_compaction_jobs<'a>(
        &'a self,
        request: PollCompactionJobsRequest,
    ) -> BoxFuture<'a, Result<PollCompactionJobsResponse, PollError>>;
}
