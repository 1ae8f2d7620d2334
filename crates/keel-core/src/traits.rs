//! Contracts between the chain engine and its collaborators:
//! - [`ChainEventListener`]: observers of confirmed/pooled transactions (wallets)
//! - [`BlockValidator`]: structural block checks run before any UTXO mutation
//! - [`TransactionValidator`]: validity oracle consulted on pool admission

use crate::error::{BlockError, TransactionError};
use crate::types::{Block, ChainBlock, Hash256, Transaction};

/// Receives notifications about transactions entering and leaving the
/// chain state.
///
/// The engine dispatches events only after the storage transaction that
/// produced them has committed. A panicking listener is logged and skipped;
/// it never rolls back chain state.
pub trait ChainEventListener: Send + Sync {
    /// A transaction was attached: confirmed in `chain_block` at
    /// `transaction_index`, or admitted to the pool when both are `None`.
    fn on_new_transaction(
        &self,
        hash: &Hash256,
        transaction: &Transaction,
        chain_block: Option<&ChainBlock>,
        transaction_index: Option<u32>,
    );

    /// A transaction was detached from the chain state or evicted from the pool.
    fn on_remove_transaction(&self, hash: &Hash256, transaction: &Transaction);
}

/// Structural block validation, invoked once per block attach.
pub trait BlockValidator: Send + Sync {
    fn validate_block(&self, block: &Block) -> Result<(), BlockError>;
}

/// Transaction validity oracle (scripts, signatures, policy).
pub trait TransactionValidator: Send + Sync {
    fn validate_transaction(&self, transaction: &Transaction) -> Result<(), TransactionError>;
}
