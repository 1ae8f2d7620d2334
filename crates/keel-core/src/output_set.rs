//! In-memory output lookup and a transaction builder on top of it.
//!
//! Used by test-data builders and block-template assembly, where the full
//! chain state is not needed to resolve input amounts.

use std::collections::HashMap;

use crate::error::TransactionError;
use crate::types::{Hash256, OutPoint, Transaction, TxInput, TxOutput};

/// Outputs known to the caller, keyed by outpoint.
#[derive(Debug, Clone, Default)]
pub struct TransactionOutputSet {
    outputs: HashMap<OutPoint, TxOutput>,
}

impl TransactionOutputSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every output of `tx`. Returns the transaction hash.
    pub fn add_transaction(&mut self, tx: &Transaction) -> Hash256 {
        let txid = tx.hash();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.outputs.insert(
                OutPoint {
                    txid,
                    index: index as u32,
                },
                output.clone(),
            );
        }
        txid
    }

    pub fn get_output(&self, outpoint: &OutPoint) -> Result<&TxOutput, TransactionError> {
        self.outputs
            .get(outpoint)
            .ok_or_else(|| TransactionError::UnknownOutput(outpoint.to_string()))
    }

    /// Forget an output, e.g. once a built transaction spends it.
    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<TxOutput> {
        self.outputs.remove(outpoint)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Fee paid by `tx`: spent amounts minus output amounts.
    pub fn fee_of(&self, tx: &Transaction) -> Result<u64, TransactionError> {
        let mut have = 0u64;
        for input in &tx.inputs {
            let spent = self.get_output(&input.previous_output)?;
            have = have
                .checked_add(spent.value)
                .ok_or(TransactionError::ValueOverflow)?;
        }
        let need = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
        have.checked_sub(need)
            .ok_or(TransactionError::NotEnoughInputAmounts { have, need })
    }
}

/// Builds a transaction, resolving input amounts through a
/// [`TransactionOutputSet`].
///
/// # Example
/// ```ignore
/// let tx = TransactionBuilder::new()
///     .add_input(&outputs, outpoint, vec![])?
///     .add_output(40, script)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    version: u32,
    inputs: Vec<TxInput>,
    outputs: Vec<TxOutput>,
    spent_amount: u64,
    lock_time: u32,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            spent_amount: 0,
            lock_time: 0,
        }
    }

    /// Add the generation input of a coinbase. `coinbase_data` keeps
    /// coinbases at different heights distinct.
    pub fn add_generation_input(&mut self, coinbase_data: Vec<u8>) -> &mut Self {
        self.inputs.push(TxInput {
            previous_output: OutPoint::null(),
            unlocking_script: coinbase_data,
            sequence: u32::MAX,
        });
        self
    }

    /// Spend `outpoint`, which must be present in `output_set`.
    pub fn add_input(
        &mut self,
        output_set: &TransactionOutputSet,
        outpoint: OutPoint,
        unlocking_script: Vec<u8>,
    ) -> Result<&mut Self, TransactionError> {
        let spent = output_set.get_output(&outpoint)?;
        self.spent_amount = self
            .spent_amount
            .checked_add(spent.value)
            .ok_or(TransactionError::ValueOverflow)?;
        self.inputs.push(TxInput {
            previous_output: outpoint,
            unlocking_script,
            sequence: u32::MAX,
        });
        Ok(self)
    }

    pub fn add_output(&mut self, value: u64, locking_script: Vec<u8>) -> &mut Self {
        self.outputs.push(TxOutput { value, locking_script });
        self
    }

    pub fn set_lock_time(&mut self, lock_time: u32) -> &mut Self {
        self.lock_time = lock_time;
        self
    }

    pub fn build(&self) -> Result<Transaction, TransactionError> {
        if self.inputs.is_empty() {
            return Err(TransactionError::NotEnoughTransactionInput);
        }
        if self.outputs.is_empty() {
            return Err(TransactionError::NotEnoughTransactionOutput);
        }

        let has_generation = self.inputs.iter().any(TxInput::is_generation);
        if has_generation && self.inputs.len() > 1 {
            return Err(TransactionError::GenerationInputWithOtherInputs);
        }

        let tx = Transaction {
            version: self.version,
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            lock_time: self.lock_time,
        };

        // Generation inputs create value; everything else must be funded.
        if !has_generation {
            let need = tx.total_output_value().ok_or(TransactionError::ValueOverflow)?;
            if self.spent_amount < need {
                return Err(TransactionError::NotEnoughInputAmounts {
                    have: self.spent_amount,
                    need,
                });
            }
        }
        Ok(tx)
    }
}
