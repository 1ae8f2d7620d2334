//! Key-value storage abstraction used by the chain engine.
//!
//! - [`KeyValueStore`]: the backend contract: point reads/writes, ordered
//!   prefix scans, and atomic batches.
//! - [`MemoryStore`]: `BTreeMap` backend for tests.
//! - [`StorageTransaction`]: a write overlay over any backend. Reads see the
//!   transaction's own uncommitted writes; [`commit`](StorageTransaction::commit)
//!   applies everything as one [`WriteBatch`], and dropping without commit
//!   discards it.
//!
//! The production backend (RocksDB) lives in keel-node.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::StoreError;

/// Logical keyspaces. Each maps to a RocksDB column family in production.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// block hash → `BlockInfo`
    BlockInfo,
    /// block hash → `Block`
    Block,
    /// height (BE) → block hash, best chain only
    HeightIndex,
    /// transaction hash → `TransactionDescriptor`
    TransactionIndex,
    /// transaction hash → `TransactionPoolEntry`
    PoolEntry,
    /// created_at_nanos (BE) || transaction hash → empty
    PoolTimeIndex,
    /// block hash → `OrphanBlockDescriptor`
    OrphanBlock,
    /// parent hash || orphan hash → empty
    OrphanBlockByParent,
    /// arrival sequence (BE) || orphan hash → empty
    OrphanBlockArrival,
    /// transaction hash → `OrphanTransactionDescriptor`
    OrphanTransaction,
    /// parent hash || orphan hash → empty
    OrphanTransactionByParent,
    /// arrival sequence (BE) || orphan hash → empty
    OrphanTransactionArrival,
    /// best tip, record counters, arrival sequences
    Meta,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Column::BlockInfo,
        Column::Block,
        Column::HeightIndex,
        Column::TransactionIndex,
        Column::PoolEntry,
        Column::PoolTimeIndex,
        Column::OrphanBlock,
        Column::OrphanBlockByParent,
        Column::OrphanBlockArrival,
        Column::OrphanTransaction,
        Column::OrphanTransactionByParent,
        Column::OrphanTransactionArrival,
        Column::Meta,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockInfo => "block_info",
            Column::Block => "block",
            Column::HeightIndex => "height_index",
            Column::TransactionIndex => "transaction_index",
            Column::PoolEntry => "pool_entry",
            Column::PoolTimeIndex => "pool_time_index",
            Column::OrphanBlock => "orphan_block",
            Column::OrphanBlockByParent => "orphan_block_by_parent",
            Column::OrphanBlockArrival => "orphan_block_arrival",
            Column::OrphanTransaction => "orphan_transaction",
            Column::OrphanTransactionByParent => "orphan_transaction_by_parent",
            Column::OrphanTransactionArrival => "orphan_transaction_arrival",
            Column::Meta => "meta",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { column: Column, key: Vec<u8>, value: Vec<u8> },
    Delete { column: Column, key: Vec<u8> },
}

/// An ordered list of writes applied atomically by [`KeyValueStore::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

/// Backend contract required by the chain engine.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;

    /// All entries of `column` whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply every operation of `batch` atomically.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// In-memory backend. No persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries across all columns.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.inner.read().get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.inner
            .write()
            .insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.inner.write().remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.inner.read();
        Ok(guard
            .range((column, prefix.to_vec())..)
            .take_while(|((entry_column, key), _)| *entry_column == column && key.starts_with(prefix))
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.clone()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.clone()));
                }
            }
        }
        Ok(())
    }
}

/// A unit of work over a [`KeyValueStore`].
///
/// Writes are buffered; reads consult the buffer first so later steps of
/// the same unit observe earlier ones. Nothing reaches the backend until
/// [`commit`](Self::commit).
pub struct StorageTransaction<'a> {
    store: &'a dyn KeyValueStore,
    /// `None` marks a pending delete.
    pending: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
    finished: bool,
}

impl<'a> StorageTransaction<'a> {
    pub fn begin(store: &'a dyn KeyValueStore) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
            finished: false,
        }
    }

    pub fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.pending.get(&(column, key.to_vec())) {
            Some(pending) => Ok(pending.clone()),
            None => self.store.get(column, key),
        }
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.pending.insert((column, key.into()), Some(value.into()));
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.pending.insert((column, key.into()), None);
    }

    /// Prefix scan over the backend merged with this transaction's writes.
    pub fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.scan_prefix(column, prefix)?.into_iter().collect();

        let overlay = self
            .pending
            .range((column, prefix.to_vec())..)
            .take_while(|((entry_column, key), _)| *entry_column == column && key.starts_with(prefix));
        for ((_, key), value) in overlay {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        Ok(merged.into_iter().collect())
    }

    /// Number of buffered writes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Apply all buffered writes atomically.
    pub fn commit(mut self) -> Result<(), StoreError> {
        self.finished = true;
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for ((column, key), value) in std::mem::take(&mut self.pending) {
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        self.store.write_batch(&batch)
    }

    /// Discard all buffered writes.
    pub fn abort(mut self) {
        self.finished = true;
        self.pending.clear();
    }
}

impl Drop for StorageTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            tracing::debug!(
                writes = self.pending.len(),
                "storage transaction dropped without commit, discarding writes"
            );
        }
    }
}
