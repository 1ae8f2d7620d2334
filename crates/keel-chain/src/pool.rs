//! Unconfirmed transaction pool.

use std::sync::Arc;

use tracing::debug;

use keel_core::error::KeelError;
use keel_core::types::{Hash256, Transaction};

use crate::db::ChainDb;
use crate::transaction_magnet::TransactionMagnet;

pub struct TransactionPool {
    magnet: Arc<TransactionMagnet>,
}

impl TransactionPool {
    pub fn new(magnet: Arc<TransactionMagnet>) -> Self {
        Self { magnet }
    }

    /// Admit `tx` to the pool. Returns `false` if it is already pooled or
    /// confirmed. The caller holds the admission stripes and has run the
    /// validity oracle.
    pub fn add_transaction_to_pool(
        &self,
        db: &mut ChainDb<'_>,
        hash: &Hash256,
        tx: &Transaction,
    ) -> Result<bool, KeelError> {
        if db.has_pool_entry(hash)? || db.has_transaction_descriptor(hash)? {
            debug!(tx = %hash, "transaction already known, skipping pool admission");
            return Ok(false);
        }
        self.magnet.attach_transaction(db, hash, tx, false, None)?;
        debug!(tx = %hash, inputs = tx.inputs.len(), outputs = tx.outputs.len(), "transaction pooled");
        Ok(true)
    }

    /// Drop the pool record of `hash`, leaving its spent claims in place.
    /// Used when the transaction has just been confirmed. No-op if absent.
    pub fn remove_transaction_from_pool(&self, db: &mut ChainDb<'_>, hash: &Hash256) -> Result<(), KeelError> {
        if let Some(entry) = db.pool_entry(hash)? {
            db.delete_pool_entry(hash)?;
            db.delete_pool_time_index(entry.created_at_nanos, hash);
        }
        Ok(())
    }

    /// Up to `count` pooled transactions, oldest admission first.
    ///
    /// Time index entries whose pool record is gone are pruned.
    pub fn get_oldest_transactions(
        &self,
        db: &mut ChainDb<'_>,
        count: usize,
    ) -> Result<Vec<(Hash256, Transaction)>, KeelError> {
        let mut oldest = Vec::with_capacity(count.min(64));
        let mut pruned = 0usize;
        for (created_at_nanos, hash) in db.pool_time_index()? {
            if oldest.len() >= count {
                break;
            }
            match db.pool_entry(&hash)? {
                Some(entry) => oldest.push((hash, entry.transaction)),
                None => {
                    db.delete_pool_time_index(created_at_nanos, &hash);
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            debug!(pruned, "pruned dangling pool time index entries");
        }
        Ok(oldest)
    }

    pub fn get(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<Option<Transaction>, KeelError> {
        Ok(db.pool_entry(hash)?.map(|entry| entry.transaction))
    }

    pub fn contains(&self, db: &ChainDb<'_>, hash: &Hash256) -> Result<bool, KeelError> {
        db.has_pool_entry(hash)
    }

    pub fn size(&self, db: &ChainDb<'_>) -> Result<usize, KeelError> {
        db.pool_len()
    }
}
