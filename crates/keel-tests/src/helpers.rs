//! Shared builders for end-to-end and property tests.

use std::sync::Arc;

use parking_lot::Mutex;

use keel_chain::{Blockchain, ChainConfig};
use keel_core::merkle;
use keel_core::storage::MemoryStore;
use keel_core::traits::ChainEventListener;
use keel_core::types::{Block, BlockHeader, ChainBlock, Hash256, OutPoint, Transaction, TxInput, TxOutput};
use keel_core::validation::{StructuralBlockValidator, StructuralTransactionValidator};

/// Coinbase paying `values`. `tag` keeps coinbases of different blocks distinct.
pub fn make_coinbase(tag: u64, values: &[u64]) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            unlocking_script: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: values
            .iter()
            .map(|value| TxOutput {
                value: *value,
                locking_script: vec![],
            })
            .collect(),
        lock_time: 0,
    }
}

/// Unsigned spend of `inputs` paying `values`.
pub fn make_tx(inputs: &[OutPoint], values: &[u64]) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs
            .iter()
            .map(|outpoint| TxInput {
                previous_output: *outpoint,
                unlocking_script: vec![0; 8],
                sequence: u32::MAX,
            })
            .collect(),
        outputs: values
            .iter()
            .map(|value| TxOutput {
                value: *value,
                locking_script: vec![],
            })
            .collect(),
        lock_time: 0,
    }
}

pub fn outpoint(tx: &Transaction, index: u32) -> OutPoint {
    OutPoint {
        txid: tx.hash(),
        index,
    }
}

/// Block with a fresh coinbase followed by `txs`, carrying exactly `work`
/// units of chain work (for `work` well below `u64::MAX`).
pub fn make_block(prev_hash: Hash256, tag: u64, work: u64, txs: Vec<Transaction>) -> Block {
    let mut transactions = vec![make_coinbase(tag, &[50])];
    transactions.extend(txs);
    let merkle_root = merkle::calculate(&transactions).unwrap_or(Hash256::ZERO);
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root,
            timestamp: tag,
            target: u64::MAX / work.max(1),
            nonce: tag,
        },
        transactions,
    }
}

/// A chain over a fresh in-memory store.
pub fn memory_chain() -> Blockchain {
    memory_chain_with(ChainConfig::default())
}

pub fn memory_chain_with(config: ChainConfig) -> Blockchain {
    Blockchain::open(
        Arc::new(MemoryStore::new()),
        config,
        Arc::new(StructuralBlockValidator),
        Arc::new(StructuralTransactionValidator),
    )
    .unwrap_or_else(|err| panic!("opening in-memory chain: {err}"))
}

/// Put `block` and return whether it became the tip.
pub fn put(chain: &Blockchain, block: &Block) -> bool {
    chain
        .put_block(&block.hash(), block)
        .unwrap_or_else(|err| panic!("put_block {}: {err}", block.hash()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Confirmed { hash: Hash256, height: u64, index: u32 },
    Pooled(Hash256),
    Removed(Hash256),
}

/// Listener that keeps every event it receives.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn removed(&self) -> Vec<Hash256> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Recorded::Removed(hash) => Some(*hash),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ChainEventListener for RecordingListener {
    fn on_new_transaction(
        &self,
        hash: &Hash256,
        _transaction: &Transaction,
        chain_block: Option<&ChainBlock>,
        transaction_index: Option<u32>,
    ) {
        let event = match (chain_block, transaction_index) {
            (Some(block), Some(index)) => Recorded::Confirmed {
                hash: *hash,
                height: block.height,
                index,
            },
            _ => Recorded::Pooled(*hash),
        };
        self.events.lock().push(event);
    }

    fn on_remove_transaction(&self, hash: &Hash256, _transaction: &Transaction) {
        self.events.lock().push(Recorded::Removed(*hash));
    }
}
