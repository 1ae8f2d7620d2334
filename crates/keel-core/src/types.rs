//! Core ledger types: transactions, blocks, and the chain metadata records
//! the engine keeps about them.
//!
//! Identities are double SHA-256 over a fixed little-endian byte layout, so
//! hashing never depends on the storage codec.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte hash value.
///
/// Used for transaction hashes, block header hashes and merkle roots.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. A block whose `prev_hash` is zero is the genesis block.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// `SHA-256(SHA-256(data))`.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Hash of the transaction holding the output.
    pub txid: Hash256,
    /// Index of the output within that transaction.
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint, used by generation (coinbase) inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Reference to a specific input of a transaction: the spender side of an
/// [`OutPoint`].
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct InPoint {
    /// Hash of the spending transaction.
    pub txid: Hash256,
    /// Index of the input within the spending transaction.
    pub index: u32,
}

impl fmt::Display for InPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null for generation inputs.
    pub previous_output: OutPoint,
    /// Opaque unlocking script, interpreted by the validity oracle only.
    pub unlocking_script: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn is_generation(&self) -> bool {
        self.previous_output.is_null()
    }
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Opaque locking script.
    pub locking_script: Vec<u8>,
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Transaction hash: double SHA-256 over the canonical byte layout.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(64 + self.inputs.len() * 80 + self.outputs.len() * 40);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            data.extend_from_slice(input.previous_output.txid.as_bytes());
            data.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_bytes(&mut data, &input.unlocking_script);
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }
        data.extend_from_slice(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            data.extend_from_slice(&output.value.to_le_bytes());
            write_bytes(&mut data, &output.locking_script);
        }
        data.extend_from_slice(&self.lock_time.to_le_bytes());
        double_sha256(&data)
    }

    /// A coinbase transaction has exactly one input and it is a generation input.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].is_generation()
    }

    /// Sum of all output values. `None` on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

fn write_bytes(data: &mut Vec<u8>, bytes: &[u8]) {
    data.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    data.extend_from_slice(bytes);
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    pub version: u32,
    /// Hash of the parent header. Zero for the genesis block.
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Proof-of-work target. Smaller targets represent more work.
    pub target: u64,
    pub nonce: u64,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing.
    const HASH_SIZE: usize = 4 + 2 * 32 + 3 * 8;

    /// Block identity: double SHA-256 over
    /// `version || prev_hash || merkle_root || timestamp || target || nonce`,
    /// integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        double_sha256(&data)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    /// Work contributed by this header: `u64::MAX / target`.
    ///
    /// A zero target is treated as the hardest possible target.
    pub fn work(&self) -> u64 {
        u64::MAX / self.target.max(1)
    }
}

#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    pub header: BlockHeader,
    /// Ordered transactions. The first one is the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }
}

/// Whether a stored block is currently connected to the best chain.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum BlockStatus {
    /// Stored, but its transactions are not linked into the UTXO graph.
    Stored,
    /// Attached: on the best chain, transactions linked.
    Connected,
}

/// Where a block body lives in storage.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockRecordLocator {
    /// Key of the body record.
    pub block_hash: Hash256,
    /// Encoded size of the body in bytes.
    pub size: u32,
}

/// Chain metadata kept for every stored block, on or off the best chain.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockInfo {
    pub height: u64,
    /// Cumulative work from genesis up to and including this block.
    pub chain_work: u64,
    /// Set iff the block is on the best chain and is not the tip.
    pub next_block_hash: Option<Hash256>,
    pub transaction_count: u32,
    pub status: BlockStatus,
    pub header: BlockHeader,
    /// `None` when only the header is known.
    pub block_locator: Option<BlockRecordLocator>,
}

impl BlockInfo {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }
}

/// Position of a transaction inside a stored block.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TransactionLocator {
    pub block_hash: Hash256,
    pub index: u32,
}

/// Record for a transaction confirmed in a block on the best chain.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TransactionDescriptor {
    pub locator: TransactionLocator,
    pub block_height: u64,
    /// One slot per output: the input spending it, if any.
    pub outputs_spent_by: Vec<Option<InPoint>>,
}

/// Record for a validated but unconfirmed transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TransactionPoolEntry {
    pub transaction: Transaction,
    /// One slot per output: the input spending it, if any.
    pub outputs_spent_by: Vec<Option<InPoint>>,
    /// Admission time in nanoseconds since the Unix epoch.
    pub created_at_nanos: u64,
}

/// A block waiting for its parent to become known.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct OrphanBlockDescriptor {
    pub block: Block,
    /// Position in arrival order; the lowest is evicted first.
    pub arrival: u64,
}

/// A transaction waiting for one or more parent transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct OrphanTransactionDescriptor {
    pub transaction: Transaction,
    pub arrival: u64,
}

/// The block a transaction was confirmed in, handed to chain event listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainBlock {
    pub height: u64,
    pub block: Arc<Block>,
}
