//! Node composition: one RocksDB store, one chain engine.

use std::sync::Arc;

use tracing::{debug, info};

use keel_chain::Blockchain;
use keel_core::storage::KeyValueStore;
use keel_core::traits::ChainEventListener;
use keel_core::types::{ChainBlock, Hash256, Transaction};
use keel_core::validation::{StructuralBlockValidator, StructuralTransactionValidator};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::storage::RocksStore;

/// Logs every chain event at debug level.
pub struct TracingListener;

impl ChainEventListener for TracingListener {
    fn on_new_transaction(
        &self,
        hash: &Hash256,
        transaction: &Transaction,
        chain_block: Option<&ChainBlock>,
        transaction_index: Option<u32>,
    ) {
        match chain_block {
            Some(block) => debug!(
                tx = %hash,
                height = block.height,
                index = transaction_index,
                outputs = transaction.outputs.len(),
                "transaction confirmed"
            ),
            None => debug!(tx = %hash, outputs = transaction.outputs.len(), "transaction pooled"),
        }
    }

    fn on_remove_transaction(&self, hash: &Hash256, _transaction: &Transaction) {
        debug!(tx = %hash, "transaction removed");
    }
}

pub struct Node {
    config: NodeConfig,
    store: Arc<RocksStore>,
    chain: Arc<Blockchain>,
}

impl Node {
    /// Open storage under `config.db_path()` and the chain engine over it.
    pub fn start(config: NodeConfig) -> Result<Self, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(RocksStore::open(config.db_path())?);
        let backend: Arc<dyn KeyValueStore> = store.clone();
        let chain = Arc::new(Blockchain::open(
            backend,
            config.chain.clone(),
            Arc::new(StructuralBlockValidator),
            Arc::new(StructuralTransactionValidator),
        )?);
        chain.add_listener(Arc::new(TracingListener));

        info!(
            data_dir = %config.data_dir.display(),
            height = chain.get_best_height(),
            "keel node started"
        );
        Ok(Self { config, store, chain })
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Flush storage and release the database.
    pub fn shutdown(self) -> Result<(), NodeError> {
        self.store.flush()?;
        info!(height = self.chain.get_best_height(), "keel node stopped");
        Ok(())
    }
}
