//! The chain-state engine entry point.
//!
//! [`Blockchain`] owns the best-tip cache and composes the magnets, the
//! pool and the orphanages over one [`KeyValueStore`]. Each mutating call
//! runs in a single storage transaction and dispatches its chain events
//! only after that transaction commits.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use keel_core::error::{ChainError, KeelError, StoreError};
use keel_core::storage::KeyValueStore;
use keel_core::traits::{BlockValidator, ChainEventListener, TransactionValidator};
use keel_core::types::{
    Block, BlockHeader, BlockInfo, BlockStatus, Hash256, OutPoint, Transaction, TxOutput,
};
use keel_core::validation::{StructuralBlockValidator, StructuralTransactionValidator};

use crate::block_magnet::BlockMagnet;
use crate::config::ChainConfig;
use crate::db::ChainDb;
use crate::events::{self, ChainEvent};
use crate::locator::BlockLocator;
use crate::orphanage::{BlockOrphanage, TransactionOrphanage};
use crate::pool::TransactionPool;
use crate::transaction_magnet::TransactionMagnet;

/// Cached best-chain tip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BestBlock {
    pub hash: Hash256,
    pub info: BlockInfo,
}

/// Outcome of [`Blockchain::accept_block`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// Already stored.
    Duplicate,
    Stored {
        /// Whether the block became the best tip when it was put.
        adopted: bool,
        /// Orphans stored because this block (transitively) supplied their parent.
        connected_orphans: usize,
    },
    /// Parent unknown. `root` is the deepest held orphan on this branch;
    /// its parent is the block to fetch.
    Orphan { root: Hash256, stored: bool },
}

/// Outcome of [`Blockchain::accept_transaction`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionAcceptance {
    AlreadyKnown,
    Pooled { connected_orphans: usize },
    Orphan { missing_parents: Vec<Hash256>, stored: bool },
}

pub struct Blockchain {
    store: Arc<dyn KeyValueStore>,
    config: ChainConfig,
    chain_lock: RwLock<()>,
    best_block: RwLock<Option<BestBlock>>,
    transaction_magnet: Arc<TransactionMagnet>,
    pool: Arc<TransactionPool>,
    block_magnet: BlockMagnet,
    block_orphanage: BlockOrphanage,
    transaction_orphanage: TransactionOrphanage,
    transaction_validator: Arc<dyn TransactionValidator>,
    listeners: RwLock<Vec<Arc<dyn ChainEventListener>>>,
}

impl Blockchain {
    /// Open the engine over `store`, restoring the persisted best tip.
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        config: ChainConfig,
        block_validator: Arc<dyn BlockValidator>,
        transaction_validator: Arc<dyn TransactionValidator>,
    ) -> Result<Self, KeelError> {
        let best = {
            let db = ChainDb::begin(store.as_ref());
            match db.best_block_hash()? {
                Some(hash) => {
                    let info = db.block_info(&hash)?.ok_or_else(|| {
                        StoreError::Backend(format!("best block {hash} has no block info"))
                    })?;
                    Some(BestBlock { hash, info })
                }
                None => None,
            }
        };
        match &best {
            Some(best) => info!(height = best.info.height, hash = %best.hash, "chain state loaded"),
            None => info!("empty chain state"),
        }

        let transaction_magnet = Arc::new(TransactionMagnet::new(config.lock_stripes));
        let pool = Arc::new(TransactionPool::new(Arc::clone(&transaction_magnet)));
        let block_magnet = BlockMagnet::new(Arc::clone(&transaction_magnet), Arc::clone(&pool), block_validator);

        Ok(Self {
            store,
            block_orphanage: BlockOrphanage::new(config.max_orphan_blocks),
            transaction_orphanage: TransactionOrphanage::new(config.max_orphan_transactions),
            config,
            chain_lock: RwLock::new(()),
            best_block: RwLock::new(best),
            transaction_magnet,
            pool,
            block_magnet,
            transaction_validator,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Open with the default config and the structural validators.
    pub fn open_with_defaults(store: Arc<dyn KeyValueStore>) -> Result<Self, KeelError> {
        Self::open(
            store,
            ChainConfig::default(),
            Arc::new(StructuralBlockValidator),
            Arc::new(StructuralTransactionValidator),
        )
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn ChainEventListener>) {
        self.listeners.write().push(listener);
    }

    fn reader(&self) -> ChainDb<'_> {
        ChainDb::begin(self.store.as_ref())
    }

    /// Run `read` over the best tip and the store as they stand together;
    /// no block is connected or disconnected until it returns.
    pub(crate) fn with_chain_view<R>(
        &self,
        read: impl FnOnce(Option<&BestBlock>, &ChainDb<'_>) -> Result<R, KeelError>,
    ) -> Result<R, KeelError> {
        let _chain_guard = self.chain_lock.read();
        let best = self.best_block.read().clone();
        read(best.as_ref(), &self.reader())
    }

    fn dispatch(&self, events: Vec<ChainEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        events::dispatch(&listeners, &events);
    }

    // --- Mutations ---

    /// Store `block` and connect it if it extends or overtakes the best
    /// chain. Returns `false` for duplicates and for side-chain blocks
    /// that do not carry more work than the tip.
    ///
    /// The parent must already be stored; see [`accept_block`](Self::accept_block)
    /// for orphan handling.
    pub fn put_block(&self, hash: &Hash256, block: &Block) -> Result<bool, KeelError> {
        debug_assert_eq!(*hash, block.hash(), "put_block hash must be the header hash");
        let chain_guard = self.chain_lock.write();
        let mut db = ChainDb::begin(self.store.as_ref());

        if db.has_block_info(hash)? {
            debug!(block = %hash, "duplicate block ignored");
            return Ok(false);
        }
        let best = self.best_block.read().clone();

        let new_best = if block.header.is_genesis() {
            if best.is_some() {
                return Err(ChainError::GenesisAlreadyExists(hash.to_string()).into());
            }
            let block_info = Self::store_block(&mut db, hash, block, None)?;
            self.block_magnet.attach_block(&mut db, &block_info, block)?;
            true
        } else {
            let parent = db
                .block_info(&block.header.prev_hash)?
                .ok_or_else(|| ChainError::ParentBlockNotFound(block.header.prev_hash.to_string()))?;
            let best = best.ok_or_else(|| ChainError::BlockNotFound(block.header.prev_hash.to_string()))?;
            let block_info = Self::store_block(&mut db, hash, block, Some(&parent))?;

            if block.header.prev_hash == best.hash {
                self.block_magnet.attach_block(&mut db, &block_info, block)?;
                true
            } else if block_info.chain_work > best.info.chain_work {
                self.block_magnet.reorganize(&mut db, &best.info, &block_info)?;
                true
            } else {
                debug!(
                    block = %hash,
                    height = block_info.height,
                    chain_work = block_info.chain_work,
                    best_work = best.info.chain_work,
                    "block stored on side chain"
                );
                false
            }
        };

        let adopted = if new_best {
            db.put_best_block_hash(hash);
            let connected = db
                .block_info(hash)?
                .ok_or_else(|| ChainError::BlockNotFound(hash.to_string()))?;
            Some(BestBlock {
                hash: *hash,
                info: connected,
            })
        } else {
            None
        };

        let events = db.commit()?;
        if let Some(best) = &adopted {
            info!(
                height = best.info.height,
                hash = %best.hash,
                chain_work = best.info.chain_work,
                txs = best.info.transaction_count,
                "best block updated"
            );
            *self.best_block.write() = Some(best.clone());
        }
        drop(chain_guard);

        self.dispatch(events);
        Ok(adopted.is_some())
    }

    fn store_block(
        db: &mut ChainDb<'_>,
        hash: &Hash256,
        block: &Block,
        parent: Option<&BlockInfo>,
    ) -> Result<BlockInfo, KeelError> {
        let locator = db.put_block(hash, block)?;
        let block_info = BlockInfo {
            height: parent.map_or(0, |p| p.height + 1),
            chain_work: parent
                .map_or(0, |p| p.chain_work)
                .saturating_add(block.header.work()),
            next_block_hash: None,
            transaction_count: block.transactions.len() as u32,
            status: BlockStatus::Stored,
            header: block.header.clone(),
            block_locator: Some(locator),
        };
        db.put_block_info(hash, &block_info)?;
        Ok(block_info)
    }

    /// Validate `tx` and admit it to the pool. Returns `false` if it is
    /// already pooled or confirmed.
    pub fn put_transaction(&self, hash: &Hash256, tx: &Transaction) -> Result<bool, KeelError> {
        self.transaction_validator.validate_transaction(tx)?;

        let chain_guard = self.chain_lock.read();
        let stripes = self.transaction_magnet.lock_for_admission(hash, tx);
        let mut db = ChainDb::begin(self.store.as_ref());
        let added = self.pool.add_transaction_to_pool(&mut db, hash, tx)?;
        let events = db.commit()?;
        drop(stripes);
        drop(chain_guard);

        self.dispatch(events);
        Ok(added)
    }

    /// Put `block`, or hold it as an orphan if its parent is unknown. After
    /// a successful put, orphans waiting on it are put in turn.
    pub fn accept_block(&self, block: &Block) -> Result<BlockAcceptance, KeelError> {
        let hash = block.hash();
        if self.has_block(&hash)? {
            return Ok(BlockAcceptance::Duplicate);
        }

        if !block.header.is_genesis() {
            // Shared chain lock: a parent put cannot slip between the check
            // and the orphan write, so its orphan scan will see this block.
            let _chain_guard = self.chain_lock.read();
            let mut db = ChainDb::begin(self.store.as_ref());
            if !db.has_block_info(&block.header.prev_hash)? {
                let stored = self.block_orphanage.put_orphan(&mut db, &hash, block)?;
                let root = if self.block_orphanage.has_orphan(&db, &hash)? {
                    self.block_orphanage.get_orphan_root(&db, &hash)?
                } else {
                    hash
                };
                db.commit()?;
                return Ok(BlockAcceptance::Orphan { root, stored });
            }
        }

        let adopted = self.put_block(&hash, block)?;
        let connected_orphans = self.connect_orphan_blocks(hash)?;
        Ok(BlockAcceptance::Stored {
            adopted,
            connected_orphans,
        })
    }

    fn connect_orphan_blocks(&self, parent: Hash256) -> Result<usize, KeelError> {
        let mut connected = 0;
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            let mut db = ChainDb::begin(self.store.as_ref());
            let mut waiting = Vec::new();
            for child in self.block_orphanage.get_orphans_depending_on(&db, &parent)? {
                if let Some(descriptor) = self.block_orphanage.get_orphan(&db, &child)? {
                    waiting.push((child, descriptor.block));
                }
                self.block_orphanage.remove_orphan(&mut db, &child)?;
            }
            self.block_orphanage.remove_dependencies_on(&mut db, &parent)?;
            db.commit()?;

            for (child, block) in waiting {
                match self.put_block(&child, &block) {
                    Ok(_) => {
                        connected += 1;
                        queue.push_back(child);
                    }
                    Err(err) => warn!(block = %child, error = %err, "dropping orphan block"),
                }
            }
        }
        if connected > 0 {
            debug!(parent = %parent, connected, "orphan blocks connected");
        }
        Ok(connected)
    }

    /// Pool `tx`, or hold it as an orphan if a parent is unknown. After a
    /// successful admission, orphans waiting on it are retried.
    pub fn accept_transaction(&self, tx: &Transaction) -> Result<TransactionAcceptance, KeelError> {
        let hash = tx.hash();
        match self.put_transaction(&hash, tx) {
            Ok(true) => {}
            Ok(false) => return Ok(TransactionAcceptance::AlreadyKnown),
            Err(KeelError::Chain(ChainError::ParentTransactionNotFound(_))) => {
                let orphaned = {
                    let _stripes = self.transaction_magnet.lock_for_admission(&hash, tx);
                    let mut db = ChainDb::begin(self.store.as_ref());
                    let missing_parents = self.transaction_orphanage.missing_parents(&db, tx)?;
                    if missing_parents.is_empty() {
                        None
                    } else {
                        let stored = self.transaction_orphanage.put_orphan(&mut db, &hash, tx)?;
                        db.commit()?;
                        Some(TransactionAcceptance::Orphan {
                            missing_parents,
                            stored,
                        })
                    }
                };
                // Every parent arrived after the failed admission; try again.
                return match orphaned {
                    Some(orphan) => Ok(orphan),
                    None => self.accept_transaction(tx),
                };
            }
            Err(err) => return Err(err),
        }

        let connected_orphans = self.connect_orphan_transactions(hash)?;
        Ok(TransactionAcceptance::Pooled { connected_orphans })
    }

    fn connect_orphan_transactions(&self, parent: Hash256) -> Result<usize, KeelError> {
        let mut connected = 0;
        let mut queue = VecDeque::from([parent]);
        while let Some(parent) = queue.pop_front() {
            let mut db = ChainDb::begin(self.store.as_ref());
            let mut waiting = Vec::new();
            for child in self.transaction_orphanage.get_orphans_depending_on(&db, &parent)? {
                if let Some(descriptor) = self.transaction_orphanage.get_orphan(&db, &child)? {
                    waiting.push((child, descriptor.transaction));
                }
                self.transaction_orphanage.remove_orphan(&mut db, &child)?;
            }
            self.transaction_orphanage.remove_dependencies_on(&mut db, &parent)?;
            db.commit()?;

            for (child, tx) in waiting {
                match self.put_transaction(&child, &tx) {
                    Ok(true) => {
                        connected += 1;
                        queue.push_back(child);
                    }
                    Ok(false) => {}
                    Err(KeelError::Chain(ChainError::ParentTransactionNotFound(_))) => {
                        // Still waiting on another parent.
                        let mut db = ChainDb::begin(self.store.as_ref());
                        self.transaction_orphanage.put_orphan(&mut db, &child, &tx)?;
                        db.commit()?;
                    }
                    Err(err) => debug!(tx = %child, error = %err, "dropping orphan transaction"),
                }
            }
        }
        Ok(connected)
    }

    // --- Queries ---

    pub fn best_block(&self) -> Option<BestBlock> {
        self.best_block.read().clone()
    }

    pub fn get_best_block_hash(&self) -> Option<Hash256> {
        self.best_block.read().as_ref().map(|best| best.hash)
    }

    pub fn get_best_block_info(&self) -> Option<BlockInfo> {
        self.best_block.read().as_ref().map(|best| best.info.clone())
    }

    pub fn get_best_height(&self) -> Option<u64> {
        self.best_block.read().as_ref().map(|best| best.info.height)
    }

    /// Best-chain block at `height`.
    pub fn get_block_hash(&self, height: u64) -> Result<Hash256, KeelError> {
        self.reader()
            .block_hash_at(height)?
            .ok_or_else(|| ChainError::InvalidBlockHeight(height).into())
    }

    pub fn get_block_info(&self, hash: &Hash256) -> Result<Option<BlockInfo>, KeelError> {
        self.reader().block_info(hash)
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.reader().has_block_info(hash)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, KeelError> {
        self.reader().block(hash)
    }

    pub fn get_block_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, KeelError> {
        Ok(self.reader().block_info(hash)?.map(|info| info.header))
    }

    /// Confirmed or pooled transaction.
    pub fn get_transaction(&self, hash: &Hash256) -> Result<Option<Transaction>, KeelError> {
        self.reader().transaction(hash)
    }

    /// Info of the best-chain block confirming `hash`.
    pub fn get_transaction_block_info(&self, hash: &Hash256) -> Result<Option<BlockInfo>, KeelError> {
        let db = self.reader();
        match db.transaction_descriptor(hash)? {
            Some(descriptor) => db.block_info(&descriptor.locator.block_hash),
            None => Ok(None),
        }
    }

    pub fn has_transaction(&self, hash: &Hash256) -> Result<bool, KeelError> {
        let db = self.reader();
        Ok(db.has_transaction_descriptor(hash)? || db.has_pool_entry(hash)?)
    }

    /// The output `outpoint` references, confirmed or pooled.
    ///
    /// Generation inputs have no output to look up; callers must not pass
    /// the null outpoint.
    pub fn get_transaction_output(&self, outpoint: &OutPoint) -> Result<TxOutput, KeelError> {
        debug_assert!(!outpoint.is_null(), "generation outpoints reference no output");
        let invalid = || ChainError::InvalidTransactionOutPoint(outpoint.to_string());
        let tx = self.reader().transaction(&outpoint.txid)?.ok_or_else(invalid)?;
        tx.outputs
            .into_iter()
            .nth(outpoint.index as usize)
            .ok_or_else(|| invalid().into())
    }

    /// Up to `count` pooled transactions, oldest first.
    pub fn get_oldest_transactions(&self, count: usize) -> Result<Vec<(Hash256, Transaction)>, KeelError> {
        let _chain_guard = self.chain_lock.read();
        let mut db = ChainDb::begin(self.store.as_ref());
        let oldest = self.pool.get_oldest_transactions(&mut db, count)?;
        db.commit()?;
        Ok(oldest)
    }

    pub fn pool_size(&self) -> Result<usize, KeelError> {
        self.pool.size(&self.reader())
    }

    pub fn get_pool_transaction(&self, hash: &Hash256) -> Result<Option<Transaction>, KeelError> {
        self.pool.get(&self.reader(), hash)
    }

    pub fn pool_contains(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.pool.contains(&self.reader(), hash)
    }

    /// Deepest common ancestor of two stored blocks.
    pub fn find_common_block(&self, a: &Hash256, b: &Hash256) -> Result<BlockInfo, KeelError> {
        let db = self.reader();
        let a = db.block_info(a)?.ok_or_else(|| ChainError::BlockNotFound(a.to_string()))?;
        let b = db.block_info(b)?.ok_or_else(|| ChainError::BlockNotFound(b.to_string()))?;
        self.block_magnet.find_common_block(&db, &a, &b)
    }

    pub fn has_orphan_block(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.block_orphanage.has_orphan(&self.reader(), hash)
    }

    pub fn has_orphan_transaction(&self, hash: &Hash256) -> Result<bool, KeelError> {
        self.transaction_orphanage.has_orphan(&self.reader(), hash)
    }

    pub fn orphan_block_count(&self) -> Result<usize, KeelError> {
        self.block_orphanage.len(&self.reader())
    }

    pub fn orphan_transaction_count(&self) -> Result<usize, KeelError> {
        self.transaction_orphanage.len(&self.reader())
    }

    pub fn locator(&self) -> BlockLocator<'_> {
        BlockLocator::new(self)
    }
}
