//! Merkle root over a block's transaction hashes.
//!
//! Internal nodes are `SHA256d(left || right)`. A layer with an odd number
//! of entries duplicates its last hash before pairing. A single-leaf tree's
//! root is the leaf itself.

use crate::error::BlockError;
use crate::types::{double_sha256, Hash256, Transaction};

/// Compute an internal node hash: `SHA256d(left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(left.as_bytes());
    data[32..].copy_from_slice(right.as_bytes());
    double_sha256(&data)
}

/// Compute the merkle root of a list of leaf hashes.
///
/// Returns `None` for an empty list: a block without transactions has no root.
pub fn merkle_root(leaves: &[Hash256]) -> Option<Hash256> {
    if leaves.is_empty() {
        return None;
    }

    let mut current = leaves.to_vec();
    while current.len() > 1 {
        current = next_layer(&current);
    }
    Some(current[0])
}

/// Merkle root of a block's transactions.
pub fn calculate(transactions: &[Transaction]) -> Result<Hash256, BlockError> {
    let hashes: Vec<Hash256> = transactions.iter().map(Transaction::hash).collect();
    merkle_root(&hashes).ok_or(BlockError::NoTransactions)
}

fn next_layer(layer: &[Hash256]) -> Vec<Hash256> {
    layer
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            node_hash(left, right)
        })
        .collect()
}
