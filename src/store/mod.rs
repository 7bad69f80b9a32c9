//! Durable key-value storage for metastore records.
//!
//! Records are grouped in buckets and keyed by shard, tenant and record id.
//! All writes go through [`KvStore::update`]: the closure stages puts and
//! deletes on a [`Transaction`], and the store makes them visible atomically
//! only if the closure returns `Ok`.

mod memory;

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;

/// Record families kept by the metastore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bucket {
    /// Metadata of every recorded block.
    BlockMetadata,
    /// Compaction job records.
    CompactionJobs,
    /// Blocks waiting for a job, per shard and level.
    CompactionBlockQueue,
}

/// Address of a record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    /// Record family.
    pub bucket: Bucket,
    /// Shard the record belongs to.
    pub shard: u32,
    /// Tenant the record belongs to; may be empty.
    pub tenant: String,
    /// Record id within the bucket.
    pub id: String,
}

impl Key {
    /// Build a key.
    pub fn new(bucket: Bucket, shard: u32, tenant: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            bucket,
            shard,
            tenant: tenant.into(),
            id: id.into(),
        }
    }

    fn bucket_start(bucket: Bucket) -> Self {
        Self::new(bucket, 0, "", "")
    }

    fn shard_start(bucket: Bucket, shard: u32) -> Self {
        Self::new(bucket, shard, "", "")
    }
}

/// Errors raised by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record could not be encoded or decoded.
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// The backend failed to persist a transaction.
    #[error("store backend error: {0}")]
    Backend(String),
    /// The store rejects writes.
    #[error("store is read-only")]
    ReadOnly,
    /// The transaction closure aborted.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

/// Staged writes of one transaction; `None` marks a delete.
pub(crate) type WriteSet = BTreeMap<Key, Option<Vec<u8>>>;

/// Read-your-writes view over committed data plus staged changes.
#[derive(Debug)]
pub struct Transaction<'a> {
    base: &'a BTreeMap<Key, Vec<u8>>,
    writes: WriteSet,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(base: &'a BTreeMap<Key, Vec<u8>>) -> Self {
        Self {
            base,
            writes: WriteSet::new(),
        }
    }

    pub(crate) fn into_writes(self) -> WriteSet {
        self.writes
    }

    /// Returns `true` if nothing has been staged.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Raw value of `key`.
    pub fn get(&self, key: &Key) -> Option<&[u8]> {
        match self.writes.get(key) {
            Some(staged) => staged.as_deref(),
            None => self.base.get(key).map(Vec::as_slice),
        }
    }

    /// Stage a raw write.
    pub fn put(&mut self, key: Key, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    /// Stage a delete. Deleting a missing key is not an error.
    pub fn delete(&mut self, key: Key) {
        self.writes.insert(key, None);
    }

    /// Raw records of `bucket`, optionally restricted to one shard, in key order.
    pub fn scan(&self, bucket: Bucket, shard: Option<u32>) -> Vec<(Key, Vec<u8>)> {
        let start = match shard {
            Some(shard) => Key::shard_start(bucket, shard),
            None => Key::bucket_start(bucket),
        };
        let in_range =
            |key: &Key| key.bucket == bucket && shard.map_or(true, |shard| key.shard == shard);
        let mut merged: BTreeMap<Key, Vec<u8>> = self
            .base
            .range(start.clone()..)
            .take_while(|(key, _)| in_range(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, staged) in self.writes.range(start..).take_while(|(key, _)| in_range(key)) {
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Decode the record at `key`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &Key) -> Result<Option<T>, StoreError> {
        self.get(key)
            .map(|raw| serde_json::from_slice(raw))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Encode and stage `value` at `key`.
    pub fn put_json<T: Serialize>(&mut self, key: Key, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_vec(value)?;
        self.put(key, raw);
        Ok(())
    }

    /// Decode every record of `bucket`, optionally restricted to one shard.
    pub fn scan_json<T: DeserializeOwned>(
        &self,
        bucket: Bucket,
        shard: Option<u32>,
    ) -> Result<Vec<T>, StoreError> {
        self.scan(bucket, shard)
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(StoreError::from))
            .collect()
    }
}

/// Transactional key-value store.
pub trait KvStore: Send + Sync {
    /// Run `f` in a read-write transaction, committing its writes atomically
    /// if it returns `Ok`. Nothing is written on `Err`.
    fn update<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, StoreError>;

    /// Run `f` against a consistent snapshot.
    fn view<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>;
}
