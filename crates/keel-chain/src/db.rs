//! Typed chain records over a [`StorageTransaction`].
//!
//! Every top-level engine mutation opens one [`ChainDb`], performs all of
//! its reads and writes through it, and commits once. Events raised along
//! the way are returned by [`ChainDb::commit`] so they can be dispatched
//! only after the writes are durable.

use keel_core::error::{KeelError, StoreError};
use keel_core::storage::{Column, KeyValueStore, StorageTransaction};
use keel_core::types::{
    Block, BlockInfo, BlockRecordLocator, Hash256, OrphanBlockDescriptor,
    OrphanTransactionDescriptor, Transaction, TransactionDescriptor, TransactionPoolEntry,
};

use crate::events::ChainEvent;

const BEST_BLOCK_KEY: &[u8] = b"best_block";
const POOL_COUNT_KEY: &[u8] = b"count/pool";
const ORPHAN_BLOCK_COUNT_KEY: &[u8] = b"count/orphan_block";
const ORPHAN_TRANSACTION_COUNT_KEY: &[u8] = b"count/orphan_transaction";
const ORPHAN_BLOCK_SEQUENCE_KEY: &[u8] = b"sequence/orphan_block";
const ORPHAN_TRANSACTION_SEQUENCE_KEY: &[u8] = b"sequence/orphan_transaction";

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, KeelError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()).into())
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, KeelError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(value)
}

fn height_key(height: u64) -> [u8; 8] {
    height.to_be_bytes()
}

fn time_key(created_at_nanos: u64, hash: &Hash256) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&created_at_nanos.to_be_bytes());
    key[8..].copy_from_slice(hash.as_bytes());
    key
}

fn decode_time_key(key: &[u8]) -> Result<(u64, Hash256), KeelError> {
    if key.len() != 40 {
        return Err(StoreError::Codec(format!("bad ordering key length {}", key.len())).into());
    }
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&key[..8]);
    Ok((u64::from_be_bytes(prefix), hash_from_slice(&key[8..])?))
}

fn dependency_key(parent: &Hash256, child: &Hash256) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(parent.as_bytes());
    key[32..].copy_from_slice(child.as_bytes());
    key
}

fn hash_from_slice(bytes: &[u8]) -> Result<Hash256, KeelError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| StoreError::Codec(format!("expected 32-byte hash, got {} bytes", bytes.len())))?;
    Ok(Hash256(array))
}

pub struct ChainDb<'a> {
    txn: StorageTransaction<'a>,
    events: Vec<ChainEvent>,
}

impl<'a> ChainDb<'a> {
    pub fn begin(store: &'a dyn KeyValueStore) -> Self {
        Self {
            txn: StorageTransaction::begin(store),
            events: Vec::new(),
        }
    }

    /// Queue an event for delivery after commit.
    pub fn emit(&mut self, event: ChainEvent) {
        self.events.push(event);
    }

    pub fn pending_events(&self) -> &[ChainEvent] {
        &self.events
    }

    /// Apply all writes atomically and hand back the queued events.
    pub fn commit(self) -> Result<Vec<ChainEvent>, KeelError> {
        let ChainDb { txn, events } = self;
        txn.commit()?;
        Ok(events)
    }

    /// Discard all writes and queued events.
    pub fn abort(self) {
        self.txn.abort();
    }

    fn get_record<T: bincode::Decode<()>>(&self, column: Column, key: &[u8]) -> Result<Option<T>, KeelError> {
        self.txn.get(column, key)?.map(|bytes| decode(&bytes)).transpose()
    }

    fn put_record<T: bincode::Encode>(&mut self, column: Column, key: &[u8], value: &T) -> Result<(), KeelError> {
        let bytes = encode(value)?;
        self.txn.put(column, key.to_vec(), bytes);
        Ok(())
    }

    fn has_key(&self, column: Column, key: &[u8]) -> Result<bool, KeelError> {
        Ok(self.txn.get(column, key)?.is_some())
    }

    fn meta_u64(&self, key: &[u8]) -> Result<u64, KeelError> {
        let Some(bytes) = self.txn.get(Column::Meta, key)? else {
            return Ok(0);
        };
        let array: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Codec(format!("expected 8-byte counter, got {} bytes", bytes.len())))?;
        Ok(u64::from_be_bytes(array))
    }

    fn put_meta_u64(&mut self, key: &[u8], value: u64) {
        self.txn.put(Column::Meta, key.to_vec(), value.to_be_bytes().to_vec());
    }

    /// Move a record counter by one in the same transaction as the record.
    fn adjust_count(&mut self, key: &[u8], grow: bool) -> Result<(), KeelError> {
        let count = self.meta_u64(key)?;
        let next = if grow { count.saturating_add(1) } else { count.saturating_sub(1) };
        self.put_meta_u64(key, next);
        Ok(())
    }

    /// Put a record, counting it if the key is new.
    fn put_counted<T: bincode::Encode>(
        &mut self,
        column: Column,
        count_key: &[u8],
        key: &[u8],
        value: &T,
    ) -> Result<(), KeelError> {
        let fresh = !self.has_key(column, key)?;
        self.put_record(column, key, value)?;
        if fresh {
            self.adjust_count(count_key, true)?;
        }
        Ok(())
    }

    fn delete_counted(&mut self, column: Column, count_key: &[u8], key: &[u8]) -> Result<(), KeelError> {
        if self.has_key(column, key)? {
            self.txn.delete(column, key.to_vec());
            self.adjust_count(count_key, false)?;
        }
        Ok(())
    }

    fn count(&self, count_key: &[u8]) -> Result<usize, KeelError> {
        Ok(usize::try_from(self.meta_u64(count_key)?).unwrap_or(usize::MAX))
    }

    /// Hand out the next value of a persistent sequence.
    fn next_sequence(&mut self, key: &[u8]) -> Result<u64, KeelError> {
        let value = self.meta_u64(key)?;
        self.put_meta_u64(key, value.saturating_add(1));
        Ok(value)
    }

    fn ordered_entries(&self, column: Column) -> Result<Vec<(u64, Hash256)>, KeelError> {
        self.txn
            .scan_prefix(column, &[])?
            .into_iter()
            .map(|(key, _)| decode_time_key(&key))
            .collect()
    }

    // --- Blocks ---

    pub fn block_info(&self, hash: &Hash256) -> Result<Option<BlockInfo>, KeelError> {
        self.get_record(Column::BlockInfo, hash.as_bytes())
    }

    pub fn has_block_info(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.has_key(Column::BlockInfo, hash.as_bytes())
    }

    pub fn put_block_info(&mut self, hash: &Hash256, info: &BlockInfo) -> Result<(), KeelError> {
        self.put_record(Column::BlockInfo, hash.as_bytes(), info)
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, KeelError> {
        self.get_record(Column::Block, hash.as_bytes())
    }

    /// Store a block body and return where it went.
    pub fn put_block(&mut self, hash: &Hash256, block: &Block) -> Result<BlockRecordLocator, KeelError> {
        let bytes = encode(block)?;
        let size = bytes.len() as u32;
        self.txn.put(Column::Block, hash.as_bytes().to_vec(), bytes);
        Ok(BlockRecordLocator {
            block_hash: *hash,
            size,
        })
    }

    pub fn block_hash_at(&self, height: u64) -> Result<Option<Hash256>, KeelError> {
        self.txn
            .get(Column::HeightIndex, &height_key(height))?
            .map(|bytes| hash_from_slice(&bytes))
            .transpose()
    }

    pub fn put_block_hash_at(&mut self, height: u64, hash: &Hash256) {
        self.txn
            .put(Column::HeightIndex, height_key(height).to_vec(), hash.as_bytes().to_vec());
    }

    pub fn delete_block_hash_at(&mut self, height: u64) {
        self.txn.delete(Column::HeightIndex, height_key(height).to_vec());
    }

    pub fn best_block_hash(&self) -> Result<Option<Hash256>, KeelError> {
        self.txn
            .get(Column::Meta, BEST_BLOCK_KEY)?
            .map(|bytes| hash_from_slice(&bytes))
            .transpose()
    }

    pub fn put_best_block_hash(&mut self, hash: &Hash256) {
        self.txn
            .put(Column::Meta, BEST_BLOCK_KEY.to_vec(), hash.as_bytes().to_vec());
    }

    // --- Confirmed transactions ---

    pub fn transaction_descriptor(&self, hash: &Hash256) -> Result<Option<TransactionDescriptor>, KeelError> {
        self.get_record(Column::TransactionIndex, hash.as_bytes())
    }

    pub fn has_transaction_descriptor(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.has_key(Column::TransactionIndex, hash.as_bytes())
    }

    pub fn put_transaction_descriptor(
        &mut self,
        hash: &Hash256,
        descriptor: &TransactionDescriptor,
    ) -> Result<(), KeelError> {
        self.put_record(Column::TransactionIndex, hash.as_bytes(), descriptor)
    }

    pub fn delete_transaction_descriptor(&mut self, hash: &Hash256) {
        self.txn.delete(Column::TransactionIndex, hash.as_bytes().to_vec());
    }

    /// Body of a confirmed transaction, read out of its block.
    pub fn confirmed_transaction(&self, hash: &Hash256) -> Result<Option<Transaction>, KeelError> {
        let Some(descriptor) = self.transaction_descriptor(hash)? else {
            return Ok(None);
        };
        let block = self
            .block(&descriptor.locator.block_hash)?
            .ok_or_else(|| StoreError::Backend(format!("missing block body {}", descriptor.locator.block_hash)))?;
        Ok(block.transactions.into_iter().nth(descriptor.locator.index as usize))
    }

    /// Confirmed or pooled transaction body.
    pub fn transaction(&self, hash: &Hash256) -> Result<Option<Transaction>, KeelError> {
        if let Some(tx) = self.confirmed_transaction(hash)? {
            return Ok(Some(tx));
        }
        Ok(self.pool_entry(hash)?.map(|entry| entry.transaction))
    }

    // --- Pool ---

    pub fn pool_entry(&self, hash: &Hash256) -> Result<Option<TransactionPoolEntry>, KeelError> {
        self.get_record(Column::PoolEntry, hash.as_bytes())
    }

    pub fn has_pool_entry(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.has_key(Column::PoolEntry, hash.as_bytes())
    }

    pub fn put_pool_entry(&mut self, hash: &Hash256, entry: &TransactionPoolEntry) -> Result<(), KeelError> {
        self.put_counted(Column::PoolEntry, POOL_COUNT_KEY, hash.as_bytes(), entry)
    }

    pub fn delete_pool_entry(&mut self, hash: &Hash256) -> Result<(), KeelError> {
        self.delete_counted(Column::PoolEntry, POOL_COUNT_KEY, hash.as_bytes())
    }

    pub fn pool_len(&self) -> Result<usize, KeelError> {
        self.count(POOL_COUNT_KEY)
    }

    pub fn put_pool_time_index(&mut self, created_at_nanos: u64, hash: &Hash256) {
        self.txn
            .put(Column::PoolTimeIndex, time_key(created_at_nanos, hash).to_vec(), Vec::new());
    }

    pub fn delete_pool_time_index(&mut self, created_at_nanos: u64, hash: &Hash256) {
        self.txn
            .delete(Column::PoolTimeIndex, time_key(created_at_nanos, hash).to_vec());
    }

    /// Time index entries, oldest first.
    pub fn pool_time_index(&self) -> Result<Vec<(u64, Hash256)>, KeelError> {
        self.ordered_entries(Column::PoolTimeIndex)
    }

    // --- Orphans ---

    pub fn orphan_block(&self, hash: &Hash256) -> Result<Option<OrphanBlockDescriptor>, KeelError> {
        self.get_record(Column::OrphanBlock, hash.as_bytes())
    }

    pub fn has_orphan_block(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.has_key(Column::OrphanBlock, hash.as_bytes())
    }

    pub fn put_orphan_block(&mut self, hash: &Hash256, descriptor: &OrphanBlockDescriptor) -> Result<(), KeelError> {
        self.put_counted(Column::OrphanBlock, ORPHAN_BLOCK_COUNT_KEY, hash.as_bytes(), descriptor)
    }

    pub fn delete_orphan_block(&mut self, hash: &Hash256) -> Result<(), KeelError> {
        self.delete_counted(Column::OrphanBlock, ORPHAN_BLOCK_COUNT_KEY, hash.as_bytes())
    }

    pub fn orphan_block_count(&self) -> Result<usize, KeelError> {
        self.count(ORPHAN_BLOCK_COUNT_KEY)
    }

    pub fn next_orphan_block_arrival(&mut self) -> Result<u64, KeelError> {
        self.next_sequence(ORPHAN_BLOCK_SEQUENCE_KEY)
    }

    pub fn next_orphan_transaction_arrival(&mut self) -> Result<u64, KeelError> {
        self.next_sequence(ORPHAN_TRANSACTION_SEQUENCE_KEY)
    }

    /// Record `hash` in an arrival index (`OrphanBlockArrival` or
    /// `OrphanTransactionArrival`).
    pub fn put_arrival(&mut self, column: Column, arrival: u64, hash: &Hash256) {
        self.txn.put(column, time_key(arrival, hash).to_vec(), Vec::new());
    }

    pub fn delete_arrival(&mut self, column: Column, arrival: u64, hash: &Hash256) {
        self.txn.delete(column, time_key(arrival, hash).to_vec());
    }

    /// Earliest entry of an arrival index.
    pub fn oldest_arrival(&self, column: Column) -> Result<Option<Hash256>, KeelError> {
        Ok(self.ordered_entries(column)?.into_iter().next().map(|(_, hash)| hash))
    }

    pub fn orphan_transaction(&self, hash: &Hash256) -> Result<Option<OrphanTransactionDescriptor>, KeelError> {
        self.get_record(Column::OrphanTransaction, hash.as_bytes())
    }

    pub fn has_orphan_transaction(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.has_key(Column::OrphanTransaction, hash.as_bytes())
    }

    pub fn put_orphan_transaction(
        &mut self,
        hash: &Hash256,
        descriptor: &OrphanTransactionDescriptor,
    ) -> Result<(), KeelError> {
        self.put_counted(
            Column::OrphanTransaction,
            ORPHAN_TRANSACTION_COUNT_KEY,
            hash.as_bytes(),
            descriptor,
        )
    }

    pub fn delete_orphan_transaction(&mut self, hash: &Hash256) -> Result<(), KeelError> {
        self.delete_counted(Column::OrphanTransaction, ORPHAN_TRANSACTION_COUNT_KEY, hash.as_bytes())
    }

    pub fn orphan_transaction_count(&self) -> Result<usize, KeelError> {
        self.count(ORPHAN_TRANSACTION_COUNT_KEY)
    }

    /// Record that orphan `child` waits on `parent`. `column` is one of the
    /// by-parent indexes.
    pub fn put_dependency(&mut self, column: Column, parent: &Hash256, child: &Hash256) {
        self.txn.put(column, dependency_key(parent, child).to_vec(), Vec::new());
    }

    pub fn delete_dependency(&mut self, column: Column, parent: &Hash256, child: &Hash256) {
        self.txn.delete(column, dependency_key(parent, child).to_vec());
    }

    /// Children registered under `parent`, in key order.
    pub fn dependents(&self, column: Column, parent: &Hash256) -> Result<Vec<Hash256>, KeelError> {
        self.txn
            .scan_prefix(column, parent.as_bytes())?
            .into_iter()
            .map(|(key, _)| hash_from_slice(key.get(32..).unwrap_or_default()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::storage::MemoryStore;
    use keel_core::types::{BlockHeader, BlockStatus, TransactionLocator};

    fn info(height: u64) -> BlockInfo {
        BlockInfo {
            height,
            chain_work: height * 10,
            next_block_hash: None,
            transaction_count: 1,
            status: BlockStatus::Stored,
            header: BlockHeader {
                version: 1,
                prev_hash: Hash256::ZERO,
                merkle_root: Hash256::ZERO,
                timestamp: height,
                target: u64::MAX,
                nonce: 0,
            },
            block_locator: None,
        }
    }

    #[test]
    fn records_survive_commit() {
        let store = MemoryStore::new();
        let hash = Hash256([1; 32]);

        let mut db = ChainDb::begin(&store);
        db.put_block_info(&hash, &info(3)).unwrap();
        db.put_block_hash_at(3, &hash);
        db.put_best_block_hash(&hash);
        assert!(db.commit().unwrap().is_empty());

        let db = ChainDb::begin(&store);
        assert_eq!(db.block_info(&hash).unwrap(), Some(info(3)));
        assert_eq!(db.block_hash_at(3).unwrap(), Some(hash));
        assert_eq!(db.block_hash_at(4).unwrap(), None);
        assert_eq!(db.best_block_hash().unwrap(), Some(hash));
    }

    #[test]
    fn abort_discards_writes_and_events() {
        let store = MemoryStore::new();
        let mut db = ChainDb::begin(&store);
        db.put_block_hash_at(0, &Hash256([1; 32]));
        db.emit(ChainEvent::RemoveTransaction {
            hash: Hash256([1; 32]),
            transaction: Transaction {
                version: 1,
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
            },
        });
        assert_eq!(db.pending_events().len(), 1);
        db.abort();
        assert!(store.is_empty());
    }

    #[test]
    fn pool_time_index_orders_by_time() {
        let store = MemoryStore::new();
        let mut db = ChainDb::begin(&store);
        db.put_pool_time_index(300, &Hash256([1; 32]));
        db.put_pool_time_index(100, &Hash256([2; 32]));
        db.put_pool_time_index(200, &Hash256([3; 32]));
        db.delete_pool_time_index(200, &Hash256([3; 32]));
        assert_eq!(
            db.pool_time_index().unwrap(),
            vec![(100, Hash256([2; 32])), (300, Hash256([1; 32]))]
        );
    }

    #[test]
    fn record_counters_track_puts_and_deletes() {
        let store = MemoryStore::new();
        let entry = TransactionPoolEntry {
            transaction: Transaction {
                version: 1,
                inputs: vec![],
                outputs: vec![],
                lock_time: 0,
            },
            outputs_spent_by: vec![],
            created_at_nanos: 1,
        };
        let (a, b) = (Hash256([1; 32]), Hash256([2; 32]));

        let mut db = ChainDb::begin(&store);
        db.put_pool_entry(&a, &entry).unwrap();
        db.put_pool_entry(&a, &entry).unwrap();
        db.put_pool_entry(&b, &entry).unwrap();
        assert_eq!(db.pool_len().unwrap(), 2);
        db.delete_pool_entry(&a).unwrap();
        db.delete_pool_entry(&a).unwrap();
        assert_eq!(db.pool_len().unwrap(), 1);
        db.commit().unwrap();

        let db = ChainDb::begin(&store);
        assert_eq!(db.pool_len().unwrap(), 1);
        assert_eq!(db.orphan_block_count().unwrap(), 0);
    }

    #[test]
    fn arrival_index_yields_oldest_first() {
        let store = MemoryStore::new();
        let mut db = ChainDb::begin(&store);
        let first = db.next_orphan_block_arrival().unwrap();
        let second = db.next_orphan_block_arrival().unwrap();
        assert_eq!((first, second), (0, 1));
        assert_eq!(db.next_orphan_transaction_arrival().unwrap(), 0);

        db.put_arrival(Column::OrphanBlockArrival, second, &Hash256([1; 32]));
        db.put_arrival(Column::OrphanBlockArrival, first, &Hash256([9; 32]));
        assert_eq!(db.oldest_arrival(Column::OrphanBlockArrival).unwrap(), Some(Hash256([9; 32])));
        db.delete_arrival(Column::OrphanBlockArrival, first, &Hash256([9; 32]));
        assert_eq!(db.oldest_arrival(Column::OrphanBlockArrival).unwrap(), Some(Hash256([1; 32])));
        assert_eq!(db.oldest_arrival(Column::OrphanTransactionArrival).unwrap(), None);
    }

    #[test]
    fn dependents_are_scoped_to_parent() {
        let store = MemoryStore::new();
        let mut db = ChainDb::begin(&store);
        let (p1, p2) = (Hash256([1; 32]), Hash256([2; 32]));
        db.put_dependency(Column::OrphanBlockByParent, &p1, &Hash256([7; 32]));
        db.put_dependency(Column::OrphanBlockByParent, &p1, &Hash256([5; 32]));
        db.put_dependency(Column::OrphanBlockByParent, &p2, &Hash256([6; 32]));
        db.put_dependency(Column::OrphanTransactionByParent, &p1, &Hash256([8; 32]));

        assert_eq!(
            db.dependents(Column::OrphanBlockByParent, &p1).unwrap(),
            vec![Hash256([5; 32]), Hash256([7; 32])]
        );
        db.delete_dependency(Column::OrphanBlockByParent, &p1, &Hash256([5; 32]));
        assert_eq!(
            db.dependents(Column::OrphanBlockByParent, &p1).unwrap(),
            vec![Hash256([7; 32])]
        );
    }

    #[test]
    fn confirmed_transaction_is_read_from_block() {
        let store = MemoryStore::new();
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time: 42,
        };
        let block = Block {
            header: info(0).header,
            transactions: vec![tx.clone()],
        };
        let block_hash = block.hash();
        let tx_hash = tx.hash();

        let mut db = ChainDb::begin(&store);
        let locator = db.put_block(&block_hash, &block).unwrap();
        assert!(locator.size > 0);
        db.put_transaction_descriptor(
            &tx_hash,
            &TransactionDescriptor {
                locator: TransactionLocator {
                    block_hash,
                    index: 0,
                },
                block_height: 0,
                outputs_spent_by: vec![],
            },
        )
        .unwrap();
        assert_eq!(db.transaction(&tx_hash).unwrap(), Some(tx));
        assert_eq!(db.transaction(&Hash256([9; 32])).unwrap(), None);
    }
}
