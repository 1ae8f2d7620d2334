//! Holding areas for blocks and transactions whose parents are unknown.
//!
//! Each orphan is stored under its own hash plus one dependency entry per
//! missing parent, so arriving parents find their waiting children with a
//! prefix scan. An arrival index orders the orphans; when an orphanage is
//! full the earliest arrival is evicted to make room.

use tracing::debug;

use keel_core::error::{ChainError, KeelError};
use keel_core::storage::Column;
use keel_core::types::{Block, Hash256, OrphanBlockDescriptor, OrphanTransactionDescriptor, Transaction};

use crate::db::ChainDb;

pub struct BlockOrphanage {
    max_orphans: usize,
}

impl BlockOrphanage {
    pub fn new(max_orphans: usize) -> Self {
        Self { max_orphans }
    }

    /// Store `block` until its parent arrives, evicting the earliest held
    /// orphans if the orphanage is full. Returns `false` if it was already
    /// held or the orphanage has no capacity at all.
    pub fn put_orphan(&self, db: &mut ChainDb<'_>, hash: &Hash256, block: &Block) -> Result<bool, KeelError> {
        if self.max_orphans == 0 || db.has_orphan_block(hash)? {
            return Ok(false);
        }
        while db.orphan_block_count()? >= self.max_orphans {
            let Some(oldest) = db.oldest_arrival(Column::OrphanBlockArrival)? else {
                break;
            };
            self.remove_orphan(db, &oldest)?;
            debug!(evicted = %oldest, limit = self.max_orphans, "orphan block limit reached");
        }

        let arrival = db.next_orphan_block_arrival()?;
        db.put_orphan_block(
            hash,
            &OrphanBlockDescriptor {
                block: block.clone(),
                arrival,
            },
        )?;
        db.put_dependency(Column::OrphanBlockByParent, &block.header.prev_hash, hash);
        db.put_arrival(Column::OrphanBlockArrival, arrival, hash);
        debug!(block = %hash, parent = %block.header.prev_hash, "block orphaned");
        Ok(true)
    }

    pub fn get_orphan(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<Option<OrphanBlockDescriptor>, KeelError> {
        db.orphan_block(hash)
    }

    pub fn has_orphan(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<bool, KeelError> {
        db.has_orphan_block(hash)
    }

    pub fn get_orphans_depending_on(&self, db: &ChainDb<'_>, parent: &Hash256) -> Result<Vec<Hash256>, KeelError> {
        db.dependents(Column::OrphanBlockByParent, parent)
    }

    pub fn remove_dependencies_on(&self, db: &mut ChainDb<'_>, parent: &Hash256) -> Result<(), KeelError> {
        for child in db.dependents(Column::OrphanBlockByParent, parent)? {
            db.delete_dependency(Column::OrphanBlockByParent, parent, &child);
        }
        Ok(())
    }

    /// Drop the orphan record together with its dependency and arrival entries.
    pub fn remove_orphan(&self, db: &mut ChainDb<'_>, hash: &Hash256) -> Result<(), KeelError> {
        if let Some(descriptor) = db.orphan_block(hash)? {
            db.delete_dependency(Column::OrphanBlockByParent, &descriptor.block.header.prev_hash, hash);
            db.delete_arrival(Column::OrphanBlockArrival, descriptor.arrival, hash);
            db.delete_orphan_block(hash)?;
        }
        Ok(())
    }

    pub fn len(&self, db: &ChainDb<'_>) -> Result<usize, KeelError> {
        db.orphan_block_count()
    }

    /// Follow `prev_hash` links through held orphans from `hash` and return
    /// the first orphan whose parent is not itself an orphan. That parent
    /// is the block to request.
    pub fn get_orphan_root(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<Hash256, KeelError> {
        let mut current = db
            .orphan_block(hash)?
            .ok_or_else(|| ChainError::BlockNotFound(hash.to_string()))?;
        let mut root = *hash;
        loop {
            let parent = current.block.header.prev_hash;
            match db.orphan_block(&parent)? {
                Some(next) => {
                    root = parent;
                    current = next;
                }
                None => return Ok(root),
            }
        }
    }
}

pub struct TransactionOrphanage {
    max_orphans: usize,
}

impl TransactionOrphanage {
    pub fn new(max_orphans: usize) -> Self {
        Self { max_orphans }
    }

    /// Parents of `tx` that are neither confirmed nor pooled.
    pub fn missing_parents(&self, db: &ChainDb<'_>, tx: &Transaction) -> Result<Vec<Hash256>, KeelError> {
        let mut missing = Vec::new();
        for input in tx.inputs.iter().filter(|input| !input.is_generation()) {
            let parent = input.previous_output.txid;
            if missing.contains(&parent) {
                continue;
            }
            if !db.has_transaction_descriptor(&parent)? && !db.has_pool_entry(&parent)? {
                missing.push(parent);
            }
        }
        Ok(missing)
    }

    /// Store `tx` under each of its missing parents, evicting the earliest
    /// held orphans if the orphanage is full. Returns `false` if it was
    /// already held or the orphanage has no capacity at all.
    pub fn put_orphan(&self, db: &mut ChainDb<'_>, hash: &Hash256, tx: &Transaction) -> Result<bool, KeelError> {
        if self.max_orphans == 0 {
            return Ok(false);
        }
        let missing = self.missing_parents(db, tx)?;
        if db.has_orphan_transaction(hash)? {
            // A re-orphaned transaction refreshes its dependency entries.
            for parent in &missing {
                db.put_dependency(Column::OrphanTransactionByParent, parent, hash);
            }
            return Ok(false);
        }
        while db.orphan_transaction_count()? >= self.max_orphans {
            let Some(oldest) = db.oldest_arrival(Column::OrphanTransactionArrival)? else {
                break;
            };
            self.remove_orphan(db, &oldest)?;
            debug!(evicted = %oldest, limit = self.max_orphans, "orphan transaction limit reached");
        }

        for parent in &missing {
            db.put_dependency(Column::OrphanTransactionByParent, parent, hash);
        }
        let arrival = db.next_orphan_transaction_arrival()?;
        db.put_orphan_transaction(
            hash,
            &OrphanTransactionDescriptor {
                transaction: tx.clone(),
                arrival,
            },
        )?;
        db.put_arrival(Column::OrphanTransactionArrival, arrival, hash);
        debug!(tx = %hash, missing = missing.len(), "transaction orphaned");
        Ok(true)
    }

    pub fn get_orphan(
        &self,
        db: &ChainDb<'_>,
        hash: &Hash256,
    ) -> Result<Option<OrphanTransactionDescriptor>, KeelError> {
        db.orphan_transaction(hash)
    }

    pub fn has_orphan(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<bool, KeelError> {
        db.has_orphan_transaction(hash)
    }

    pub fn get_orphans_depending_on(&self, db: &ChainDb<'_>, parent: &Hash256) -> Result<Vec<Hash256>, KeelError> {
        db.dependents(Column::OrphanTransactionByParent, parent)
    }

    pub fn remove_dependencies_on(&self, db: &mut ChainDb<'_>, parent: &Hash256) -> Result<(), KeelError> {
        for child in db.dependents(Column::OrphanTransactionByParent, parent)? {
            db.delete_dependency(Column::OrphanTransactionByParent, parent, &child);
        }
        Ok(())
    }

    /// Drop the orphan record and its dependency and arrival entries.
    pub fn remove_orphan(&self, db: &mut ChainDb<'_>, hash: &Hash256) -> Result<(), KeelError> {
        if let Some(descriptor) = db.orphan_transaction(hash)? {
            for input in &descriptor.transaction.inputs {
                db.delete_dependency(Column::OrphanTransactionByParent, &input.previous_output.txid, hash);
            }
            db.delete_arrival(Column::OrphanTransactionArrival, descriptor.arrival, hash);
            db.delete_orphan_transaction(hash)?;
        }
        Ok(())
    }

    pub fn len(&self, db: &ChainDb<'_>) -> Result<usize, KeelError> {
        db.orphan_transaction_count()
    }

    /// Walk missing-parent links through held orphans and return the first
    /// orphan none of whose missing parents is itself an orphan.
    pub fn get_orphan_root(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<Hash256, KeelError> {
        let mut current = db
            .orphan_transaction(hash)?
            .ok_or_else(|| ChainError::ParentTransactionNotFound(hash.to_string()))?;
        let mut root = *hash;
        loop {
            let mut next = None;
            for parent in self.missing_parents(db, &current.transaction)? {
                if let Some(descriptor) = db.orphan_transaction(&parent)? {
                    next = Some((parent, descriptor));
                    break;
                }
            }
            match next {
                Some((parent, descriptor)) => {
                    root = parent;
                    current = descriptor;
                }
                None => return Ok(root),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::storage::MemoryStore;
    use keel_core::types::{BlockHeader, OutPoint, TxInput, TxOutput};

    fn block(prev_hash: Hash256, nonce: u64) -> Block {
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: Hash256::ZERO,
                timestamp: 0,
                target: u64::MAX,
                nonce,
            },
            transactions: vec![],
        }
    }

    fn tx(parents: &[Hash256]) -> Transaction {
        Transaction {
            version: 1,
            inputs: parents
                .iter()
                .map(|txid| TxInput {
                    previous_output: OutPoint { txid: *txid, index: 0 },
                    unlocking_script: vec![],
                    sequence: u32::MAX,
                })
                .collect(),
            outputs: vec![TxOutput {
                value: 1,
                locking_script: vec![],
            }],
            lock_time: 0,
        }
    }

    // --- Blocks ---

    #[test]
    fn block_orphans_are_indexed_by_parent() {
        let store = MemoryStore::new();
        let orphanage = BlockOrphanage::new(10);
        let mut db = ChainDb::begin(&store);
        let parent = Hash256([1; 32]);
        let a = block(parent, 1);
        let b = block(parent, 2);
        assert!(orphanage.put_orphan(&mut db, &a.hash(), &a).unwrap());
        assert!(orphanage.put_orphan(&mut db, &b.hash(), &b).unwrap());
        assert!(!orphanage.put_orphan(&mut db, &a.hash(), &a).unwrap());

        let mut waiting = orphanage.get_orphans_depending_on(&db, &parent).unwrap();
        waiting.sort();
        let mut expected = vec![a.hash(), b.hash()];
        expected.sort();
        assert_eq!(waiting, expected);

        orphanage.remove_orphan(&mut db, &a.hash()).unwrap();
        assert!(!orphanage.has_orphan(&db, &a.hash()).unwrap());
        assert_eq!(orphanage.get_orphans_depending_on(&db, &parent).unwrap(), vec![b.hash()]);
        orphanage.remove_dependencies_on(&mut db, &parent).unwrap();
        assert!(orphanage.has_orphan(&db, &b.hash()).unwrap());
        assert!(orphanage.get_orphans_depending_on(&db, &parent).unwrap().is_empty());
    }

    #[test]
    fn full_block_orphanage_evicts_earliest_arrival() {
        let store = MemoryStore::new();
        let orphanage = BlockOrphanage::new(2);
        let mut db = ChainDb::begin(&store);
        let a = block(Hash256([1; 32]), 1);
        let b = block(Hash256([2; 32]), 2);
        let c = block(Hash256([3; 32]), 3);
        for orphan in [&a, &b, &c] {
            assert!(orphanage.put_orphan(&mut db, &orphan.hash(), orphan).unwrap());
        }

        assert_eq!(orphanage.len(&db).unwrap(), 2);
        assert!(!orphanage.has_orphan(&db, &a.hash()).unwrap());
        assert!(orphanage.get_orphans_depending_on(&db, &Hash256([1; 32])).unwrap().is_empty());
        assert!(orphanage.has_orphan(&db, &b.hash()).unwrap());
        assert!(orphanage.has_orphan(&db, &c.hash()).unwrap());
        assert_eq!(db.oldest_arrival(Column::OrphanBlockArrival).unwrap(), Some(b.hash()));
    }

    #[test]
    fn zero_capacity_block_orphanage_holds_nothing() {
        let store = MemoryStore::new();
        let orphanage = BlockOrphanage::new(0);
        let mut db = ChainDb::begin(&store);
        let a = block(Hash256([1; 32]), 1);
        assert!(!orphanage.put_orphan(&mut db, &a.hash(), &a).unwrap());
        assert_eq!(orphanage.len(&db).unwrap(), 0);
    }

    #[test]
    fn block_orphan_root_follows_chain() {
        let store = MemoryStore::new();
        let orphanage = BlockOrphanage::new(10);
        let mut db = ChainDb::begin(&store);
        let first = block(Hash256([1; 32]), 1);
        let second = block(first.hash(), 2);
        let third = block(second.hash(), 3);
        for b in [&third, &first, &second] {
            orphanage.put_orphan(&mut db, &b.hash(), b).unwrap();
        }
        assert_eq!(orphanage.get_orphan_root(&db, &third.hash()).unwrap(), first.hash());
        assert_eq!(orphanage.get_orphan_root(&db, &first.hash()).unwrap(), first.hash());
        assert!(orphanage.get_orphan_root(&db, &Hash256([9; 32])).is_err());
    }

    // --- Transactions ---

    #[test]
    fn transaction_orphan_waits_on_each_missing_parent() {
        let store = MemoryStore::new();
        let orphanage = TransactionOrphanage::new(10);
        let mut db = ChainDb::begin(&store);
        let (p1, p2) = (Hash256([1; 32]), Hash256([2; 32]));
        let orphan = tx(&[p1, p2, p1]);
        let hash = orphan.hash();

        assert_eq!(orphanage.missing_parents(&db, &orphan).unwrap(), vec![p1, p2]);
        assert!(orphanage.put_orphan(&mut db, &hash, &orphan).unwrap());
        assert_eq!(orphanage.get_orphans_depending_on(&db, &p1).unwrap(), vec![hash]);
        assert_eq!(orphanage.get_orphans_depending_on(&db, &p2).unwrap(), vec![hash]);

        orphanage.remove_orphan(&mut db, &hash).unwrap();
        assert!(!orphanage.has_orphan(&db, &hash).unwrap());
        assert!(orphanage.get_orphans_depending_on(&db, &p1).unwrap().is_empty());
        assert!(orphanage.get_orphans_depending_on(&db, &p2).unwrap().is_empty());
    }

    #[test]
    fn transaction_orphan_root() {
        let store = MemoryStore::new();
        let orphanage = TransactionOrphanage::new(10);
        let mut db = ChainDb::begin(&store);
        let grandparent = tx(&[Hash256([1; 32])]);
        let parent = tx(&[grandparent.hash()]);
        let child = tx(&[parent.hash()]);
        for t in [&child, &parent, &grandparent] {
            orphanage.put_orphan(&mut db, &t.hash(), t).unwrap();
        }
        assert_eq!(
            orphanage.get_orphan_root(&db, &child.hash()).unwrap(),
            grandparent.hash()
        );
    }

    #[test]
    fn full_transaction_orphanage_evicts_earliest_arrival() {
        let store = MemoryStore::new();
        let orphanage = TransactionOrphanage::new(1);
        let mut db = ChainDb::begin(&store);
        let a = tx(&[Hash256([1; 32])]);
        let b = tx(&[Hash256([2; 32])]);
        assert!(orphanage.put_orphan(&mut db, &a.hash(), &a).unwrap());
        assert!(orphanage.put_orphan(&mut db, &b.hash(), &b).unwrap());

        assert!(!orphanage.has_orphan(&db, &a.hash()).unwrap());
        assert!(orphanage.get_orphans_depending_on(&db, &Hash256([1; 32])).unwrap().is_empty());
        assert!(orphanage.has_orphan(&db, &b.hash()).unwrap());
        assert_eq!(orphanage.len(&db).unwrap(), 1);
    }
}
