//! Links transactions into the UTXO graph.
//!
//! Every output of a confirmed or pooled transaction has a spent slot
//! holding the [`InPoint`] of its single spender. Attaching a transaction
//! claims the slots its inputs reference; detaching releases them.
//! Spent slots are looked up in the confirmed index first and the pool
//! second, so a pooled transaction may spend outputs of another pooled
//! transaction.

use std::collections::HashSet;

use tracing::debug;

use keel_core::error::{ChainError, KeelError};
use keel_core::types::{
    ChainBlock, Hash256, InPoint, Transaction, TransactionDescriptor, TransactionLocator,
    TransactionPoolEntry, TxInput,
};

use crate::db::ChainDb;
use crate::events::ChainEvent;
use crate::stripes::{LockStripes, StripeGuard};

/// Where a confirmed transaction sits.
#[derive(Clone, Copy, Debug)]
pub struct BlockPlacement<'b> {
    pub locator: TransactionLocator,
    pub chain_block: &'b ChainBlock,
}

/// Spent-slot holder for one parent transaction.
enum SpendRecord {
    Confirmed(TransactionDescriptor),
    Pooled(TransactionPoolEntry),
}

impl SpendRecord {
    fn load(db: &ChainDb<'_>, txid: &Hash256) -> Result<Option<Self>, KeelError> {
        if let Some(descriptor) = db.transaction_descriptor(txid)? {
            return Ok(Some(SpendRecord::Confirmed(descriptor)));
        }
        Ok(db.pool_entry(txid)?.map(SpendRecord::Pooled))
    }

    fn slots(&self) -> &[Option<InPoint>] {
        match self {
            SpendRecord::Confirmed(descriptor) => &descriptor.outputs_spent_by,
            SpendRecord::Pooled(entry) => &entry.outputs_spent_by,
        }
    }

    fn slots_mut(&mut self) -> &mut [Option<InPoint>] {
        match self {
            SpendRecord::Confirmed(descriptor) => &mut descriptor.outputs_spent_by,
            SpendRecord::Pooled(entry) => &mut entry.outputs_spent_by,
        }
    }

    fn store(&self, db: &mut ChainDb<'_>, txid: &Hash256) -> Result<(), KeelError> {
        match self {
            SpendRecord::Confirmed(descriptor) => db.put_transaction_descriptor(txid, descriptor),
            SpendRecord::Pooled(entry) => db.put_pool_entry(txid, entry),
        }
    }
}

fn now_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map_or(0, |nanos| nanos.max(0) as u64)
}

fn outpoint_error(input: &TxInput) -> ChainError {
    ChainError::InvalidTransactionOutPoint(input.previous_output.to_string())
}

pub struct TransactionMagnet {
    stripes: LockStripes,
}

impl TransactionMagnet {
    pub fn new(lock_stripes: usize) -> Self {
        Self {
            stripes: LockStripes::new(lock_stripes),
        }
    }

    /// Stripes a pool admission of `tx` must hold until its storage
    /// transaction commits: its own hash plus every parent it spends.
    pub fn lock_for_admission(&self, hash: &Hash256, tx: &Transaction) -> StripeGuard<'_> {
        let parents = tx
            .inputs
            .iter()
            .filter(|input| !input.is_generation())
            .map(|input| &input.previous_output.txid);
        self.stripes.lock_all(std::iter::once(hash).chain(parents))
    }

    /// Claim the output `input` spends for `in_point`.
    ///
    /// Claiming a slot already held by `in_point` is a no-op. With
    /// `check_only` nothing is written.
    pub fn attach_transaction_input(
        &self,
        db: &mut ChainDb<'_>,
        in_point: InPoint,
        input: &TxInput,
        check_only: bool,
    ) -> Result<(), KeelError> {
        self.claim_output(db, in_point, input, check_only, false)
    }

    fn claim_output(
        &self,
        db: &mut ChainDb<'_>,
        in_point: InPoint,
        input: &TxInput,
        check_only: bool,
        evict_pooled_conflicts: bool,
    ) -> Result<(), KeelError> {
        let outpoint = input.previous_output;
        let index = outpoint.index as usize;
        let mut record = SpendRecord::load(db, &outpoint.txid)?
            .ok_or_else(|| ChainError::ParentTransactionNotFound(outpoint.txid.to_string()))?;
        let current = *record.slots().get(index).ok_or_else(|| outpoint_error(input))?;

        match current {
            Some(holder) if holder == in_point => return Ok(()),
            Some(holder) => {
                let evictable = evict_pooled_conflicts
                    && !check_only
                    && !db.has_transaction_descriptor(&holder.txid)?
                    && db.has_pool_entry(&holder.txid)?;
                if !evictable {
                    return Err(ChainError::TransactionOutputAlreadySpent {
                        outpoint: outpoint.to_string(),
                        spent_by: holder.to_string(),
                        attempted: in_point.to_string(),
                    }
                    .into());
                }
                debug!(conflict = %holder.txid, spender = %in_point.txid, "evicting conflicting pool spender");
                self.evict_from_pool(db, &holder.txid)?;
                record = SpendRecord::load(db, &outpoint.txid)?
                    .ok_or_else(|| ChainError::ParentTransactionNotFound(outpoint.txid.to_string()))?;
            }
            None => {}
        }

        if check_only {
            return Ok(());
        }
        let slot = record
            .slots_mut()
            .get_mut(index)
            .ok_or_else(|| outpoint_error(input))?;
        *slot = Some(in_point);
        record.store(db, &outpoint.txid)
    }

    /// Release the output `input` spends. The slot must hold `in_point`.
    pub fn detach_transaction_input(
        &self,
        db: &mut ChainDb<'_>,
        in_point: InPoint,
        input: &TxInput,
    ) -> Result<(), KeelError> {
        let outpoint = input.previous_output;
        let mut record = SpendRecord::load(db, &outpoint.txid)?
            .ok_or_else(|| ChainError::ParentTransactionNotFound(outpoint.txid.to_string()))?;
        let slot = record
            .slots_mut()
            .get_mut(outpoint.index as usize)
            .ok_or_else(|| outpoint_error(input))?;
        if *slot != Some(in_point) {
            return Err(ChainError::TransactionOutputSpentByUnexpectedInput {
                outpoint: outpoint.to_string(),
                expected: in_point.to_string(),
                actual: slot.map(|holder| holder.to_string()),
            }
            .into());
        }
        *slot = None;
        record.store(db, &outpoint.txid)
    }

    /// Attach `tx` either into a block (`placement` set) or into the pool.
    ///
    /// Input claims run first; any failure leaves `db` partially written
    /// and the caller must abort it. With `check_only` only the claims are
    /// verified.
    pub fn attach_transaction(
        &self,
        db: &mut ChainDb<'_>,
        hash: &Hash256,
        tx: &Transaction,
        check_only: bool,
        placement: Option<BlockPlacement<'_>>,
    ) -> Result<(), KeelError> {
        if !tx.is_coinbase() {
            for (index, input) in tx.inputs.iter().enumerate() {
                let in_point = InPoint {
                    txid: *hash,
                    index: index as u32,
                };
                self.claim_output(db, in_point, input, check_only, placement.is_some())?;
            }
        }
        if check_only {
            return Ok(());
        }

        match placement {
            Some(placement) => {
                // A confirming pool transaction keeps the claims its pooled
                // children already hold on its outputs.
                let outputs_spent_by = match db.pool_entry(hash)? {
                    Some(entry) => entry.outputs_spent_by,
                    None => vec![None; tx.outputs.len()],
                };
                db.put_transaction_descriptor(
                    hash,
                    &TransactionDescriptor {
                        locator: placement.locator,
                        block_height: placement.chain_block.height,
                        outputs_spent_by,
                    },
                )?;
                db.emit(ChainEvent::NewTransaction {
                    hash: *hash,
                    transaction: tx.clone(),
                    chain_block: Some(placement.chain_block.clone()),
                    transaction_index: Some(placement.locator.index),
                });
            }
            None => {
                if db.has_pool_entry(hash)? || db.has_transaction_descriptor(hash)? {
                    return Ok(());
                }
                let created_at_nanos = now_nanos();
                db.put_pool_entry(
                    hash,
                    &TransactionPoolEntry {
                        transaction: tx.clone(),
                        outputs_spent_by: vec![None; tx.outputs.len()],
                        created_at_nanos,
                    },
                )?;
                db.put_pool_time_index(created_at_nanos, hash);
                db.emit(ChainEvent::NewTransaction {
                    hash: *hash,
                    transaction: tx.clone(),
                    chain_block: None,
                    transaction_index: None,
                });
            }
        }
        Ok(())
    }

    /// Reverse of [`attach_transaction`](Self::attach_transaction).
    ///
    /// Pooled transactions still spending outputs of `tx` are evicted first
    /// and returned, parents before children, so the caller may try to
    /// re-admit them.
    pub fn detach_transaction(
        &self,
        db: &mut ChainDb<'_>,
        hash: &Hash256,
        tx: &Transaction,
    ) -> Result<Vec<(Hash256, Transaction)>, KeelError> {
        let mut evicted = Vec::new();
        if let Some(record) = SpendRecord::load(db, hash)? {
            let pooled_spenders: Vec<Hash256> = record
                .slots()
                .iter()
                .flatten()
                .map(|holder| holder.txid)
                .collect();
            for spender in pooled_spenders {
                if db.has_pool_entry(&spender)? {
                    evicted.extend(self.evict_from_pool(db, &spender)?);
                }
            }
        }

        if !tx.is_coinbase() {
            for (index, input) in tx.inputs.iter().enumerate() {
                let in_point = InPoint {
                    txid: *hash,
                    index: index as u32,
                };
                self.detach_transaction_input(db, in_point, input)?;
            }
        }

        db.delete_transaction_descriptor(hash);
        if let Some(entry) = db.pool_entry(hash)? {
            db.delete_pool_entry(hash)?;
            db.delete_pool_time_index(entry.created_at_nanos, hash);
        }
        db.emit(ChainEvent::RemoveTransaction {
            hash: *hash,
            transaction: tx.clone(),
        });
        Ok(evicted)
    }

    /// Remove `root` and every pooled descendant from the pool, releasing
    /// the slots they hold. Returns the removed transactions, parents first.
    pub fn evict_from_pool(
        &self,
        db: &mut ChainDb<'_>,
        root: &Hash256,
    ) -> Result<Vec<(Hash256, Transaction)>, KeelError> {
        let mut seen = HashSet::new();
        let mut stack = vec![*root];
        let mut order = Vec::new();
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            let Some(entry) = db.pool_entry(&hash)? else {
                continue;
            };
            stack.extend(entry.outputs_spent_by.iter().flatten().map(|holder| holder.txid));
            order.push((hash, entry));
        }

        // Children go first so each release sees its parent still present.
        for (hash, entry) in order.iter().rev() {
            for (index, input) in entry.transaction.inputs.iter().enumerate() {
                if input.is_generation() {
                    continue;
                }
                let in_point = InPoint {
                    txid: *hash,
                    index: index as u32,
                };
                self.release_if_held(db, in_point, input)?;
            }
            db.delete_pool_entry(hash)?;
            db.delete_pool_time_index(entry.created_at_nanos, hash);
            db.emit(ChainEvent::RemoveTransaction {
                hash: *hash,
                transaction: entry.transaction.clone(),
            });
        }

        Ok(order
            .into_iter()
            .map(|(hash, entry)| (hash, entry.transaction))
            .collect())
    }

    /// Clear a slot if it is held by `in_point`; skip missing parents and
    /// slots already reassigned.
    fn release_if_held(&self, db: &mut ChainDb<'_>, in_point: InPoint, input: &TxInput) -> Result<(), KeelError> {
        let outpoint = input.previous_output;
        let Some(mut record) = SpendRecord::load(db, &outpoint.txid)? else {
            return Ok(());
        };
        match record.slots_mut().get_mut(outpoint.index as usize) {
            Some(slot) if *slot == Some(in_point) => {
                *slot = None;
                record.store(db, &outpoint.txid)
            }
            _ => Ok(()),
        }
    }
}
