//! Sync negotiation: summarize the best chain for a peer and answer a
//! peer's summary with the hashes it is missing.

use keel_core::error::{ChainError, KeelError};
use keel_core::types::Hash256;

use crate::blockchain::Blockchain;
use crate::db::ChainDb;

/// Consecutive heights listed before the step starts doubling.
const DENSE_ENTRIES: usize = 10;

pub struct BlockLocator<'a> {
    chain: &'a Blockchain,
}

impl<'a> BlockLocator<'a> {
    pub fn new(chain: &'a Blockchain) -> Self {
        Self { chain }
    }

    /// Best-chain hashes from the tip backwards: ten consecutive heights,
    /// then doubling gaps, always ending with genesis. Empty before genesis.
    pub fn get_locator_hashes(&self) -> Result<Vec<Hash256>, KeelError> {
        self.chain.with_chain_view(|best, db| {
            let Some(best) = best else {
                return Ok(Vec::new());
            };

            let mut hashes = Vec::new();
            let mut height = best.info.height;
            let mut step = 1u64;
            while height > 0 {
                hashes.push(block_hash_at(db, height)?);
                if hashes.len() >= DENSE_ENTRIES {
                    step = step.saturating_mul(2);
                }
                height = height.saturating_sub(step);
            }
            hashes.push(block_hash_at(db, 0)?);
            Ok(hashes)
        })
    }

    /// Best-chain hashes a peer holding `locator_hashes` is missing.
    ///
    /// Starts at the first locator entry that is on the best chain (genesis
    /// if none is) and walks forward, including the start. Stops after
    /// `hash_stop`, after `max_hash_count` hashes (capped by the configured
    /// per-request limit), or at the tip.
    pub fn get_hashes(
        &self,
        locator_hashes: &[Hash256],
        hash_stop: &Hash256,
        max_hash_count: usize,
    ) -> Result<Vec<Hash256>, KeelError> {
        let limit = max_hash_count.min(self.chain.config().max_hashes_per_request);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.chain.with_chain_view(|best, db| {
            let Some(best) = best else {
                return Ok(Vec::new());
            };

            let mut start_height = 0;
            for hash in locator_hashes {
                let Some(info) = db.block_info(hash)? else {
                    continue;
                };
                if info.next_block_hash.is_some() || *hash == best.hash {
                    start_height = info.height;
                    break;
                }
            }

            let mut hashes = Vec::new();
            let mut height = start_height;
            while height <= best.info.height && hashes.len() < limit {
                let hash = block_hash_at(db, height)?;
                hashes.push(hash);
                if hash == *hash_stop {
                    break;
                }
                height += 1;
            }
            Ok(hashes)
        })
    }
}

fn block_hash_at(db: &ChainDb<'_>, height: u64) -> Result<Hash256, KeelError> {
    db.block_hash_at(height)?
        .ok_or_else(|| ChainError::InvalidBlockHeight(height).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use keel_core::merkle;
    use keel_core::storage::MemoryStore;
    use keel_core::types::{Block, BlockHeader, OutPoint, Transaction, TxInput, TxOutput};

    use crate::config::ChainConfig;
    use keel_core::validation::{StructuralBlockValidator, StructuralTransactionValidator};

    fn make_block(prev_hash: Hash256, tag: u64) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                unlocking_script: tag.to_le_bytes().to_vec(),
                sequence: u32::MAX,
            }],
            outputs: vec![TxOutput {
                value: 50,
                locking_script: vec![],
            }],
            lock_time: 0,
        };
        Block {
            header: BlockHeader {
                version: 1,
                prev_hash,
                merkle_root: merkle::calculate(std::slice::from_ref(&coinbase)).unwrap(),
                timestamp: tag,
                target: u64::MAX,
                nonce: tag,
            },
            transactions: vec![coinbase],
        }
    }

    /// A chain of `len` blocks; returns the hashes by height.
    fn build(chain: &Blockchain, len: u64, salt: u64) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        let mut prev = Hash256::ZERO;
        for height in 0..len {
            let block = make_block(prev, salt * 10_000 + height);
            prev = block.hash();
            chain.put_block(&prev, &block).unwrap();
            hashes.push(prev);
        }
        hashes
    }

    fn make_chain(max_hashes_per_request: usize) -> Blockchain {
        Blockchain::open(
            Arc::new(MemoryStore::new()),
            ChainConfig {
                max_hashes_per_request,
                ..ChainConfig::default()
            },
            Arc::new(StructuralBlockValidator),
            Arc::new(StructuralTransactionValidator),
        )
        .unwrap()
    }

    // --- get_locator_hashes ---

    #[test]
    fn empty_chain_has_empty_locator() {
        let chain = make_chain(500);
        assert!(chain.locator().get_locator_hashes().unwrap().is_empty());
    }

    #[test]
    fn genesis_only_locator() {
        let chain = make_chain(500);
        let hashes = build(&chain, 1, 0);
        assert_eq!(chain.locator().get_locator_hashes().unwrap(), hashes);
    }

    #[test]
    fn locator_is_dense_then_exponential() {
        let chain = make_chain(500);
        let hashes = build(&chain, 41, 0);
        let locator = chain.locator().get_locator_hashes().unwrap();

        // Heights 40..=31, then 29, 25, 17, 1, then genesis.
        let expected_heights = [40, 39, 38, 37, 36, 35, 34, 33, 32, 31, 29, 25, 17, 1, 0];
        let expected: Vec<Hash256> = expected_heights.iter().map(|h| hashes[*h]).collect();
        assert_eq!(locator, expected);
    }

    // --- get_hashes ---

    #[test]
    fn hashes_from_matching_locator_entry() {
        let chain = make_chain(500);
        let hashes = build(&chain, 6, 0);
        let got = chain
            .locator()
            .get_hashes(&[hashes[3], hashes[1]], &Hash256::ZERO, 100)
            .unwrap();
        assert_eq!(got, hashes[3..].to_vec());
    }

    #[test]
    fn unknown_locator_starts_at_genesis() {
        let chain = make_chain(500);
        let hashes = build(&chain, 4, 0);
        let got = chain
            .locator()
            .get_hashes(&[Hash256([7; 32])], &Hash256::ZERO, 100)
            .unwrap();
        assert_eq!(got, hashes);
    }

    #[test]
    fn stops_at_hash_stop_and_limits() {
        let chain = make_chain(3);
        let hashes = build(&chain, 8, 0);
        let locator = chain.locator();

        let got = locator.get_hashes(&[], &hashes[2], 100).unwrap();
        assert_eq!(got, hashes[..3].to_vec());

        // Configured cap wins over the caller's count.
        let got = locator.get_hashes(&[hashes[4]], &Hash256::ZERO, 100).unwrap();
        assert_eq!(got, hashes[4..7].to_vec());

        assert!(locator.get_hashes(&[], &Hash256::ZERO, 0).unwrap().is_empty());
    }

    #[test]
    fn side_chain_locator_entry_is_skipped() {
        let chain = make_chain(500);
        let hashes = build(&chain, 5, 0);
        // A lighter side block off genesis is known but not on the best chain.
        let side = make_block(hashes[0], 99_999);
        assert!(!chain.put_block(&side.hash(), &side).unwrap());

        let got = chain
            .locator()
            .get_hashes(&[side.hash(), hashes[2]], &Hash256::ZERO, 100)
            .unwrap();
        assert_eq!(got, hashes[2..].to_vec());
    }
}
