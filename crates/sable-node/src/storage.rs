//! Persistent storage for the chain.
//!
//! The chain processor only needs point reads, ordered prefix scans and
//! all-or-nothing write batches. [`SledStorage`] is the on-disk backend;
//! [`MemoryStorage`] keeps everything in a `BTreeMap` and can be told to
//! fail writes so tests can exercise rollback.
//!
//! Layout (all values Borsh-encoded):
//! - `chain_head` -> head `BlockHash`
//! - `block:<hash>` -> `Block`
//! - `index:<hash>` -> `IndexRecord`
//! - `tree_leaf:<position BE>` -> `Commitment`
//! - `tree_root:<height BE>` -> `(Root, size)`
//! - `nullifier:<nf>` -> spending height

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::StorageError;

/// Storage key builders.
pub mod keys {
    use sable_core::{BlockHash, Nullifier};

    /// Key of the canonical head hash.
    pub const CHAIN_HEAD: &[u8] = b"chain_head";
    /// Prefix of full blocks.
    pub const BLOCK: &[u8] = b"block:";
    /// Prefix of block index records.
    pub const INDEX: &[u8] = b"index:";
    /// Prefix of tree leaves.
    pub const TREE_LEAF: &[u8] = b"tree_leaf:";
    /// Prefix of per-height tree checkpoints.
    pub const TREE_ROOT: &[u8] = b"tree_root:";
    /// Prefix of spent nullifiers.
    pub const NULLIFIER: &[u8] = b"nullifier:";

    fn with(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(prefix.len() + suffix.len());
        key.extend_from_slice(prefix);
        key.extend_from_slice(suffix);
        key
    }

    /// `block:<hash>`.
    pub fn block(hash: &BlockHash) -> Vec<u8> {
        with(BLOCK, hash.as_bytes())
    }

    /// `index:<hash>`.
    pub fn index(hash: &BlockHash) -> Vec<u8> {
        with(INDEX, hash.as_bytes())
    }

    /// `tree_leaf:<position>`; big-endian so scans return positions in order.
    pub fn tree_leaf(position: u64) -> Vec<u8> {
        with(TREE_LEAF, &position.to_be_bytes())
    }

    /// `tree_root:<height>`; big-endian so scans return heights in order.
    pub fn tree_root(height: u64) -> Vec<u8> {
        with(TREE_ROOT, &height.to_be_bytes())
    }

    /// `nullifier:<nf>`.
    pub fn nullifier(nf: &Nullifier) -> Vec<u8> {
        with(NULLIFIER, nf.as_bytes())
    }
}

/// One mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite.
    Put(Vec<u8>, Vec<u8>),
    /// Remove if present.
    Delete(Vec<u8>),
}

/// Ordered mutations applied all-or-nothing.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw put.
    pub fn put_raw(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Queue a Borsh-encoded put.
    pub fn put<T: BorshSerialize>(&mut self, key: Vec<u8>, value: &T) -> Result<(), StorageError> {
        let bytes = borsh::to_vec(value).map_err(|e| StorageError::Codec {
            key: hex::encode(&key),
            reason: e.to_string(),
        })?;
        self.put_raw(key, bytes);
        Ok(())
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    /// Queued operations in order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Key-value backend used by the chain processor.
pub trait ChainStorage: Send + Sync {
    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply every operation of `batch` or none of them.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// Decode a Borsh value stored under `key`.
pub fn decode<T: BorshDeserialize>(key: &[u8], bytes: &[u8]) -> Result<T, StorageError> {
    T::try_from_slice(bytes).map_err(|e| StorageError::Codec {
        key: hex::encode(key),
        reason: e.to_string(),
    })
}

/// Typed point lookup.
pub fn get_decoded<T: BorshDeserialize>(
    storage: &dyn ChainStorage,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    storage
        .get(key)?
        .map(|bytes| decode(key, &bytes))
        .transpose()
}

/// sled-backed storage; each batch is applied atomically and flushed.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }
}

impl ChainStorage for SledStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut sled_batch = sled::Batch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => sled_batch.insert(k, v),
                BatchOp::Delete(k) => sled_batch.remove(k),
            }
        }
        self.db.apply_batch(sled_batch)?;
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory storage for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStorage {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `write_batch` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainStorage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Injected);
        }
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
        Ok(())
    }
}
