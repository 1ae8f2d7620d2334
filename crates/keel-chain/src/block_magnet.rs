//! Connects and disconnects blocks on the best chain, and switches
//! branches when a side chain overtakes it.

use std::sync::Arc;

use tracing::{debug, info};

use keel_core::error::{ChainError, KeelError};
use keel_core::traits::BlockValidator;
use keel_core::types::{Block, BlockInfo, BlockStatus, ChainBlock, Hash256, Transaction, TransactionLocator};

use crate::db::ChainDb;
use crate::pool::TransactionPool;
use crate::transaction_magnet::{BlockPlacement, TransactionMagnet};

/// Summary of a completed branch switch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reorganization {
    pub common_ancestor: Hash256,
    pub detached: usize,
    pub attached: usize,
    /// Transactions from the abandoned branch returned to the pool.
    pub reinserted: usize,
}

pub struct BlockMagnet {
    transactions: Arc<TransactionMagnet>,
    pool: Arc<TransactionPool>,
    validator: Arc<dyn BlockValidator>,
}

fn block_not_found(hash: &Hash256) -> KeelError {
    ChainError::BlockNotFound(hash.to_string()).into()
}

fn parent_not_found(info: &BlockInfo) -> KeelError {
    ChainError::ParentBlockNotFound(info.header.prev_hash.to_string()).into()
}

impl BlockMagnet {
    pub fn new(
        transactions: Arc<TransactionMagnet>,
        pool: Arc<TransactionPool>,
        validator: Arc<dyn BlockValidator>,
    ) -> Self {
        Self {
            transactions,
            pool,
            validator,
        }
    }

    /// Link every transaction of `block` and make it the best-chain block
    /// at its height.
    pub fn attach_block(&self, db: &mut ChainDb<'_>, block_info: &BlockInfo, block: &Block) -> Result<(), KeelError> {
        self.validator.validate_block(block)?;

        let block_hash = block_info.hash();
        let chain_block = ChainBlock {
            height: block_info.height,
            block: Arc::new(block.clone()),
        };
        for (index, tx) in block.transactions.iter().enumerate() {
            let hash = tx.hash();
            let placement = BlockPlacement {
                locator: TransactionLocator {
                    block_hash,
                    index: index as u32,
                },
                chain_block: &chain_block,
            };
            self.transactions.attach_transaction(db, &hash, tx, false, Some(placement))?;
            self.pool.remove_transaction_from_pool(db, &hash)?;
        }

        db.put_block_hash_at(block_info.height, &block_hash);
        let mut connected = block_info.clone();
        connected.status = BlockStatus::Connected;
        connected.next_block_hash = None;
        db.put_block_info(&block_hash, &connected)?;

        if !block_info.header.is_genesis() {
            let mut parent = db
                .block_info(&block_info.header.prev_hash)?
                .ok_or_else(|| parent_not_found(block_info))?;
            parent.next_block_hash = Some(block_hash);
            db.put_block_info(&block_info.header.prev_hash, &parent)?;
        }
        debug!(block = %block_hash, height = block_info.height, txs = block.transactions.len(), "block attached");
        Ok(())
    }

    /// Reverse of [`attach_block`](Self::attach_block).
    ///
    /// The block is unlinked from the best chain, then its non-coinbase
    /// transactions and the pooled spenders evicted along with them are
    /// offered back to the pool in their original order. Returns how many
    /// were re-pooled.
    pub fn detach_block(&self, db: &mut ChainDb<'_>, block_info: &BlockInfo, block: &Block) -> Result<usize, KeelError> {
        let evicted = self.unlink_block(db, block_info, block)?;
        self.reinsert_all(db, std::slice::from_ref(block), evicted)
    }

    /// Unlink `block` from the best chain, newest transaction first.
    ///
    /// Returns pooled transactions evicted because they spent outputs of
    /// the detached transactions.
    fn unlink_block(
        &self,
        db: &mut ChainDb<'_>,
        block_info: &BlockInfo,
        block: &Block,
    ) -> Result<Vec<(Hash256, Transaction)>, KeelError> {
        if block_info.header.is_genesis() {
            return Err(ChainError::CannotDetachGenesis.into());
        }

        let mut evicted = Vec::new();
        for tx in block.transactions.iter().rev() {
            evicted.extend(self.transactions.detach_transaction(db, &tx.hash(), tx)?);
        }

        let block_hash = block_info.hash();
        db.delete_block_hash_at(block_info.height);
        let mut stored = block_info.clone();
        stored.status = BlockStatus::Stored;
        stored.next_block_hash = None;
        db.put_block_info(&block_hash, &stored)?;

        let mut parent = db
            .block_info(&block_info.header.prev_hash)?
            .ok_or_else(|| parent_not_found(block_info))?;
        parent.next_block_hash = None;
        db.put_block_info(&block_info.header.prev_hash, &parent)?;

        debug!(block = %block_hash, height = block_info.height, "block detached");
        Ok(evicted)
    }

    /// Deepest block that is an ancestor of (or equal to) both arguments.
    pub fn find_common_block(
        &self,
        db: &ChainDb<'_>,
        original: &BlockInfo,
        new: &BlockInfo,
    ) -> Result<BlockInfo, KeelError> {
        let mut a = original.clone();
        let mut b = new.clone();
        loop {
            let (a_hash, b_hash) = (a.hash(), b.hash());
            if a_hash == b_hash {
                return Ok(a);
            }
            let no_ancestor = || ChainError::NoCommonAncestor(original.hash().to_string(), new.hash().to_string());
            if a.height > b.height {
                if a.header.is_genesis() {
                    return Err(no_ancestor().into());
                }
                a = db.block_info(&a.header.prev_hash)?.ok_or_else(|| parent_not_found(&a))?;
            } else if b.height > a.height {
                if b.header.is_genesis() {
                    return Err(no_ancestor().into());
                }
                b = db.block_info(&b.header.prev_hash)?.ok_or_else(|| parent_not_found(&b))?;
            } else {
                if a.header.is_genesis() || b.header.is_genesis() {
                    return Err(no_ancestor().into());
                }
                a = db.block_info(&a.header.prev_hash)?.ok_or_else(|| parent_not_found(&a))?;
                b = db.block_info(&b.header.prev_hash)?.ok_or_else(|| parent_not_found(&b))?;
            }
        }
    }

    /// Switch the best chain from `original_best` to `new_best`.
    ///
    /// Blocks above the common ancestor are detached newest first, the new
    /// branch is attached oldest first, then non-coinbase transactions of
    /// the abandoned branch are offered back to the pool. Ones that are
    /// already confirmed are skipped; ones that now conflict or lack a
    /// parent are dropped.
    pub fn reorganize(
        &self,
        db: &mut ChainDb<'_>,
        original_best: &BlockInfo,
        new_best: &BlockInfo,
    ) -> Result<Reorganization, KeelError> {
        let common = self.find_common_block(db, original_best, new_best)?;
        let common_hash = common.hash();

        let mut detached_blocks = Vec::new();
        let mut evicted = Vec::new();
        let mut cursor = original_best.clone();
        while cursor.hash() != common_hash {
            let hash = cursor.hash();
            let block = db.block(&hash)?.ok_or_else(|| block_not_found(&hash))?;
            evicted.extend(self.unlink_block(db, &cursor, &block)?);
            detached_blocks.push(block);
            cursor = db
                .block_info(&cursor.header.prev_hash)?
                .ok_or_else(|| parent_not_found(&cursor))?;
        }
        detached_blocks.reverse();

        let mut branch = Vec::new();
        let mut cursor = new_best.clone();
        while cursor.hash() != common_hash {
            let parent_hash = cursor.header.prev_hash;
            branch.push(cursor.hash());
            cursor = db.block_info(&parent_hash)?.ok_or_else(|| parent_not_found(&cursor))?;
        }
        for hash in branch.iter().rev() {
            let block_info = db.block_info(hash)?.ok_or_else(|| block_not_found(hash))?;
            let block = db.block(hash)?.ok_or_else(|| block_not_found(hash))?;
            self.attach_block(db, &block_info, &block)?;
        }

        let reinserted = self.reinsert_all(db, &detached_blocks, evicted)?;

        let outcome = Reorganization {
            common_ancestor: common_hash,
            detached: detached_blocks.len(),
            attached: branch.len(),
            reinserted,
        };
        info!(
            from = %original_best.hash(),
            to = %new_best.hash(),
            fork_height = common.height,
            detached = outcome.detached,
            attached = outcome.attached,
            reinserted = outcome.reinserted,
            "chain reorganized"
        );
        Ok(outcome)
    }

    /// Offer the non-coinbase transactions of `blocks`, then `evicted`, back
    /// to the pool.
    fn reinsert_all(
        &self,
        db: &mut ChainDb<'_>,
        blocks: &[Block],
        evicted: Vec<(Hash256, Transaction)>,
    ) -> Result<usize, KeelError> {
        let abandoned = blocks
            .iter()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| (tx.hash(), tx.clone()))
            .chain(evicted);
        let mut reinserted = 0;
        for (hash, tx) in abandoned {
            if self.reinsert(db, &hash, &tx)? {
                reinserted += 1;
            }
        }
        Ok(reinserted)
    }

    fn reinsert(&self, db: &mut ChainDb<'_>, hash: &Hash256, tx: &Transaction) -> Result<bool, KeelError> {
        if db.has_transaction_descriptor(hash)? || db.has_pool_entry(hash)? {
            return Ok(false);
        }
        match self.pool.add_transaction_to_pool(db, hash, tx) {
            Ok(added) => Ok(added),
            Err(KeelError::Chain(
                err @ (ChainError::TransactionOutputAlreadySpent { .. } | ChainError::ParentTransactionNotFound(_)),
            )) => {
                debug!(tx = %hash, error = %err, "dropping transaction from detached block");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}
