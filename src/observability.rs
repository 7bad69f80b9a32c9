//! Log macros shared by the metastore and the worker.
//!
//! Events go to the `kiln` target. Every event names the subsystem that
//! emitted it in `component` (`planner`, `queue`, `metastore`, `raft`,
//! `store` or `worker`) and what happened in a snake_case `event`, such as
//! `job_created`, `job_assigned`, `stale_status_ignored` or `poll_failed`.
//!
//! Job events carry `job`, `tenant`, `shard` and `level`. Block events carry
//! `block`. Lease events put the issued fencing token in `token`, and a
//! rejected report adds the token the queue holds as `current_token`.
//! Failures attach `error` with Display formatting.
//!
//! No subscriber is installed here; binaries embedding kiln decide where the
//! events go.

/// Target of every kiln event.
pub(crate) const KILN_TARGET: &str = "kiln";

/// Info event on the kiln target.
///
/// # Example
/// ```ignore
/// log_info!(
///     component = "metastore",
///     event = "job_assigned",
///     job = %job.name,
///     token = job.commit_index
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::KILN_TARGET, $($field)*)
    };
}

/// Debug event on the kiln target.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::KILN_TARGET, $($field)*)
    };
}

/// Warning on the kiln target.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::KILN_TARGET, $($field)*)
    };
}

/// Error on the kiln target.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::KILN_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
