//! Context-free validators shipped with the engine.
//!
//! Neither interprets scripts. Deployments that verify signatures wrap or
//! replace [`StructuralTransactionValidator`].

use std::collections::HashSet;

use crate::error::{BlockError, TransactionError};
use crate::merkle;
use crate::traits::{BlockValidator, TransactionValidator};
use crate::types::{Block, Transaction};

/// Checks:
/// - at least one transaction
/// - first transaction is coinbase, no other is
/// - no duplicate transaction hashes
/// - every transaction is well formed
/// - header merkle root matches the transactions
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralBlockValidator;

impl BlockValidator for StructuralBlockValidator {
    fn validate_block(&self, block: &Block) -> Result<(), BlockError> {
        let coinbase = block.transactions.first().ok_or(BlockError::NoTransactions)?;
        if !coinbase.is_coinbase() {
            return Err(BlockError::FirstTxNotCoinbase);
        }

        let mut seen = HashSet::with_capacity(block.transactions.len());
        for (index, tx) in block.transactions.iter().enumerate() {
            if index > 0 && tx.is_coinbase() {
                return Err(BlockError::MultipleCoinbase);
            }
            check_transaction_shape(tx)
                .map_err(|source| BlockError::Transaction { index, source })?;
            let hash = tx.hash();
            if !seen.insert(hash) {
                return Err(BlockError::DuplicateTransaction(hash.to_string()));
            }
        }

        let computed = merkle::calculate(&block.transactions)?;
        if computed != block.header.merkle_root {
            return Err(BlockError::InvalidMerkleRoot {
                header: block.header.merkle_root.to_string(),
                computed: computed.to_string(),
            });
        }
        Ok(())
    }
}

/// Pool admission checks: a free-standing transaction may not be a coinbase,
/// and must satisfy [`check_transaction_shape`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralTransactionValidator;

impl TransactionValidator for StructuralTransactionValidator {
    fn validate_transaction(&self, transaction: &Transaction) -> Result<(), TransactionError> {
        if transaction.is_coinbase() {
            return Err(TransactionError::CoinbaseNotAllowed);
        }
        check_transaction_shape(transaction)
    }
}

/// Inputs and outputs present, a generation input only on its own, and
/// output values that do not overflow.
pub fn check_transaction_shape(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.inputs.is_empty() {
        return Err(TransactionError::NotEnoughTransactionInput);
    }
    if tx.outputs.is_empty() {
        return Err(TransactionError::NotEnoughTransactionOutput);
    }
    if tx.inputs.len() > 1 && tx.inputs.iter().any(|input| input.is_generation()) {
        return Err(TransactionError::GenerationInputWithOtherInputs);
    }
    tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
    Ok(())
}
