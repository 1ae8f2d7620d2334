//! Error types for the Keel chain engine.
use thiserror::Error;

/// Failures raised by the chain-state engine while linking blocks and
/// transactions into the UTXO graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("invalid block height: {0}")] InvalidBlockHeight(u64),
    #[error("invalid transaction outpoint: {0}")] InvalidTransactionOutPoint(String),
    #[error("parent transaction not found: {0}")] ParentTransactionNotFound(String),
    #[error("output {outpoint} already spent by {spent_by}, rejected spender {attempted}")]
    TransactionOutputAlreadySpent { outpoint: String, spent_by: String, attempted: String },
    #[error("output {outpoint} spent by {actual:?}, expected {expected}")]
    TransactionOutputSpentByUnexpectedInput { outpoint: String, expected: String, actual: Option<String> },
    #[error("block not found: {0}")] BlockNotFound(String),
    #[error("parent block not found: {0}")] ParentBlockNotFound(String),
    #[error("genesis block already exists, rejected {0}")] GenesisAlreadyExists(String),
    #[error("the genesis block cannot be detached")] CannotDetachGenesis,
    #[error("no common ancestor between {0} and {1}")] NoCommonAncestor(String, String),
}

/// Structural block validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block has no transactions")] NoTransactions,
    #[error("first transaction is not coinbase")] FirstTxNotCoinbase,
    #[error("multiple coinbase transactions")] MultipleCoinbase,
    #[error("invalid merkle root: header {header}, computed {computed}")] InvalidMerkleRoot { header: String, computed: String },
    #[error("duplicate transaction: {0}")] DuplicateTransaction(String),
    #[error("tx error in {index}: {source}")] Transaction { index: usize, source: TransactionError },
}

/// Transaction construction and structural validity failures.
///
/// Raised before a transaction is ever handed to the chain engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("generation input mixed with other inputs")] GenerationInputWithOtherInputs,
    #[error("transaction has no inputs")] NotEnoughTransactionInput,
    #[error("transaction has no outputs")] NotEnoughTransactionOutput,
    #[error("input amounts too small: have {have}, need {need}")] NotEnoughInputAmounts { have: u64, need: u64 },
    #[error("coinbase transaction not allowed here")] CoinbaseNotAllowed,
    #[error("value overflow")] ValueOverflow,
    #[error("unknown output: {0}")] UnknownOutput(String),
}

/// Failure reported by a key-value backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backend: {0}")] Backend(String),
    #[error("codec: {0}")] Codec(String),
}

#[derive(Error, Debug)]
pub enum KeelError {
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Transaction(#[from] TransactionError),
    #[error("storage: {0}")] Storage(String),
}

impl From<StoreError> for KeelError {
    fn from(err: StoreError) -> Self {
        KeelError::Storage(err.to_string())
    }
}

impl KeelError {
    /// The chain-level error, if this is one.
    pub fn as_chain(&self) -> Option<&ChainError> {
        match self {
            KeelError::Chain(e) => Some(e),
            _ => None,
        }
    }
}
