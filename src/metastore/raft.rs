//! Consensus seam and a single-node log implementing it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    clock::Clock,
    metastore::{
        command::{Command, CommandResponse, LogEntry},
        state::MetastoreState,
        MetastoreError,
    },
    observability::{log_debug, log_warn},
    store::KvStore,
};

/// Linearizable command application.
///
/// Returns the log index the command was applied at together with the state
/// machine response.
pub trait Consensus: Send + Sync {
    /// Append `command` and apply it to the state machine.
    fn apply(&self, command: Command) -> Result<(u64, CommandResponse), MetastoreError>;
}

#[derive(Debug, Default)]
struct LogInner {
    last_index: u64,
    last_appended_at_ms: i64,
    entries: Vec<LogEntry>,
}

/// Single-node log applying commands in append order.
///
/// Entries are kept once applied, so the same history can be replayed into a
/// fresh state machine.
pub struct LocalLog<S> {
    clock: Arc<dyn Clock>,
    state: Arc<MetastoreState<S>>,
    inner: Mutex<LogInner>,
}

impl<S: KvStore> LocalLog<S> {
    /// Create a log in front of `state`, stamping entries with `clock`.
    pub fn new(state: Arc<MetastoreState<S>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state,
            inner: Mutex::new(LogInner::default()),
        }
    }

    /// Create a log continuing after `last_index`, for a state restored from
    /// a store that already holds entries up to that index.
    pub fn resume(state: Arc<MetastoreState<S>>, clock: Arc<dyn Clock>, last_index: u64) -> Self {
        Self {
            clock,
            state,
            inner: Mutex::new(LogInner {
                last_index,
                ..LogInner::default()
            }),
        }
    }

    /// State machine the log applies to.
    pub fn state(&self) -> &Arc<MetastoreState<S>> {
        &self.state
    }

    /// Applied entries in log order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().entries.clone()
    }

    /// Index of the last applied entry; 0 for an empty log.
    pub fn last_index(&self) -> u64 {
        self.inner.lock().last_index
    }

    /// Apply every entry of this log to `target`, in order.
    pub fn replay_into<T: KvStore>(&self, target: &MetastoreState<T>) -> Result<(), MetastoreError> {
        let entries = self.entries();
        for entry in &entries {
            target.apply(entry)?;
        }
        log_debug!(
            component = "raft",
            event = "log_replayed",
            entries = entries.len()
        );
        Ok(())
    }
}

impl<S: KvStore> Consensus for LocalLog<S> {
    fn apply(&self, command: Command) -> Result<(u64, CommandResponse), MetastoreError> {
        let mut inner = self.inner.lock();
        let entry = LogEntry {
            index: inner.last_index + 1,
            // Entry time never goes backwards, even if the clock does.
            appended_at_ms: self.clock.now_ms().max(inner.last_appended_at_ms),
            command,
        };
        match self.state.apply(&entry) {
            Ok(response) => {
                inner.last_index = entry.index;
                inner.last_appended_at_ms = entry.appended_at_ms;
                let index = entry.index;
                inner.entries.push(entry);
                Ok((index, response))
            }
            Err(error) => {
                log_warn!(
                    component = "raft",
                    event = "apply_failed",
                    index = entry.index,
                    command = entry.command.kind(),
                    error = %error
                );
                Err(error)
            }
        }
    }
}

impl<S> std::fmt::Debug for LocalLog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalLog")
            .field("last_index", &inner.last_index)
            .field("entries", &inner.entries.len())
            .finish_non_exhaustive()
    }
}
