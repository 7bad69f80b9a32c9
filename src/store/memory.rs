use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::RwLock;

use crate::{
    observability::log_warn,
    store::{Key, KvStore, StoreError, Transaction},
};

/// In-memory [`KvStore`].
///
/// Writers are serialized; readers see the last committed state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Key, Vec<u8>>>,
    read_only: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every transaction that stages writes.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns `true` if nothing is committed.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn update<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>,
    {
        let mut data = self.data.write();
        let mut tx = Transaction::new(&data);
        let value = f(&mut tx)?;
        let writes = tx.into_writes();
        if writes.is_empty() {
            return Ok(value);
        }
        if self.read_only.load(Ordering::SeqCst) {
            log_warn!(
                component = "store",
                event = "write_rejected",
                writes = writes.len()
            );
            return Err(StoreError::ReadOnly);
        }
        for (key, staged) in writes {
            match staged {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(value)
    }

    fn view<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        let data = self.data.read();
        let tx = Transaction::new(&data);
        f(&tx)
    }
}
