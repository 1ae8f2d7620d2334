//! Randomized checks of the engine invariants.

use std::collections::HashMap;

use proptest::prelude::*;

use keel_chain::Blockchain;
use keel_core::error::{ChainError, KeelError};
use keel_core::types::{Block, Hash256, Transaction};
use keel_tests::helpers::{make_block, make_tx, memory_chain, outpoint, put};

fn genesis() -> Block {
    make_block(Hash256::ZERO, 0, 1, vec![])
}

// ---------------------------------------------------------------------------
// Single spender per output
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever order spends arrive in, each output admits exactly the
    /// first distinct spender and rejects the rest.
    #[test]
    fn each_output_admits_one_spender(
        width in 1usize..6,
        attempts in prop::collection::vec((0usize..6, 1u64..4), 1..24),
    ) {
        let chain = memory_chain();
        let g = genesis();
        put(&chain, &g);
        let fan_out = make_tx(&[outpoint(&g.transactions[0], 0)], &vec![1; width]);
        put(&chain, &make_block(g.hash(), 1, 10, vec![fan_out.clone()]));

        let mut winners: HashMap<usize, Hash256> = HashMap::new();
        for (index, value) in attempts {
            let index = index % width;
            let tx = make_tx(&[outpoint(&fan_out, index as u32)], &[value]);
            let hash = tx.hash();
            let result = chain.put_transaction(&hash, &tx);
            match winners.get(&index) {
                None => {
                    prop_assert!(result.unwrap());
                    winners.insert(index, hash);
                }
                Some(winner) if *winner == hash => prop_assert!(!result.unwrap()),
                Some(_) => {
                    let is_double_spend = matches!(
                        result,
                        Err(KeelError::Chain(ChainError::TransactionOutputAlreadySpent { .. }))
                    );
                    prop_assert!(is_double_spend);
                }
            }
        }
        prop_assert_eq!(chain.pool_size().unwrap(), winners.len());
    }
}

// ---------------------------------------------------------------------------
// Best chain selection
// ---------------------------------------------------------------------------

fn build_branch(chain: &Blockchain, from: Hash256, tag_base: u64, works: &[u64]) -> Vec<Block> {
    let mut prev = from;
    let mut blocks = Vec::new();
    for (i, work) in works.iter().enumerate() {
        let block = make_block(prev, tag_base + i as u64, *work, vec![]);
        put(chain, &block);
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The tip ends on the branch with more work; ties keep the first.
    #[test]
    fn best_tip_follows_most_work(
        a_works in prop::collection::vec(1u64..1000, 1..6),
        b_works in prop::collection::vec(1u64..1000, 1..6),
    ) {
        let chain = memory_chain();
        let g = genesis();
        put(&chain, &g);
        let a = build_branch(&chain, g.hash(), 100, &a_works);
        let b = build_branch(&chain, g.hash(), 200, &b_works);

        let a_sum: u64 = a_works.iter().sum();
        let b_sum: u64 = b_works.iter().sum();
        let best = chain.get_best_block_info().unwrap();
        if b_sum > a_sum {
            prop_assert_eq!(best.hash(), b.last().unwrap().hash());
            prop_assert_eq!(best.chain_work, 1 + b_sum);
        } else {
            prop_assert_eq!(best.hash(), a.last().unwrap().hash());
            prop_assert_eq!(best.chain_work, 1 + a_sum);
        }

        // Height index and next pointers agree along the best chain.
        for height in 0..best.height {
            let hash = chain.get_block_hash(height).unwrap();
            let info = chain.get_block_info(&hash).unwrap().unwrap();
            prop_assert_eq!(info.next_block_hash, Some(chain.get_block_hash(height + 1).unwrap()));
        }
        prop_assert_eq!(
            chain.find_common_block(&a.last().unwrap().hash(), &b.last().unwrap().hash()).unwrap().hash(),
            g.hash()
        );
    }

    /// Chain work of every stored block is its parent's plus its own.
    #[test]
    fn chain_work_accumulates(works in prop::collection::vec(1u64..1_000_000, 1..12)) {
        let chain = memory_chain();
        let g = genesis();
        put(&chain, &g);
        let blocks = build_branch(&chain, g.hash(), 1, &works);
        let mut expected = 1u64;
        for (block, work) in blocks.iter().zip(&works) {
            expected += work;
            let info = chain.get_block_info(&block.hash()).unwrap().unwrap();
            prop_assert_eq!(info.chain_work, expected);
        }
    }
}

// ---------------------------------------------------------------------------
// Detach and reattach
// ---------------------------------------------------------------------------

/// Spend chain rooted at the genesis coinbase, `per_block[i]` txs in block i.
fn spend_chain(g: &Block, per_block: &[usize]) -> Vec<Vec<Transaction>> {
    let mut prev = g.transactions[0].clone();
    let mut value = 1_000u64;
    per_block
        .iter()
        .map(|count| {
            (0..*count)
                .map(|_| {
                    value -= 1;
                    let tx = make_tx(&[outpoint(&prev, 0)], &[value]);
                    prev = tx.clone();
                    tx
                })
                .collect()
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Switching away from a branch pools its transactions; switching back
    /// confirms them in their original blocks again.
    #[test]
    fn reorg_round_trip_restores_confirmations(per_block in prop::collection::vec(0usize..4, 1..6)) {
        let chain = memory_chain();
        let g = genesis();
        put(&chain, &g);

        let txs = spend_chain(&g, &per_block);
        let mut prev = g.hash();
        let mut a = Vec::new();
        for (i, block_txs) in txs.iter().enumerate() {
            let block = make_block(prev, 100 + i as u64, 10, block_txs.clone());
            prop_assert!(put(&chain, &block));
            prev = block.hash();
            a.push(block);
        }
        let a_work = 10 * a.len() as u64;
        let total: usize = per_block.iter().sum();

        // A heavier single block from genesis takes over.
        let b1 = make_block(g.hash(), 500, a_work + 5, vec![]);
        prop_assert!(put(&chain, &b1));
        prop_assert_eq!(chain.pool_size().unwrap(), total);
        for tx in txs.iter().flatten() {
            prop_assert!(chain.pool_contains(&tx.hash()).unwrap());
        }

        // One more block on the old branch takes it back.
        let a_next = make_block(prev, 600, 10, vec![]);
        prop_assert!(put(&chain, &a_next));
        prop_assert_eq!(chain.pool_size().unwrap(), 0);
        for (block, block_txs) in a.iter().zip(&txs) {
            for tx in block_txs {
                let confirmed_in = chain.get_transaction_block_info(&tx.hash()).unwrap().unwrap();
                prop_assert_eq!(confirmed_in.hash(), block.hash());
            }
        }
        prop_assert!(!chain.has_transaction(&b1.transactions[0].hash()).unwrap());
    }
}

// ---------------------------------------------------------------------------
// Locator shape
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn locator_runs_from_tip_to_genesis(length in 0u64..80) {
        let chain = memory_chain();
        let g = genesis();
        put(&chain, &g);
        let blocks = build_branch(&chain, g.hash(), 1, &vec![1; length as usize]);
        let tip = blocks.last().map_or(g.hash(), Block::hash);

        let hashes = chain.locator().get_locator_hashes().unwrap();
        prop_assert_eq!(hashes.first().copied(), Some(tip));
        prop_assert_eq!(hashes.last().copied(), Some(g.hash()));

        let heights: Vec<u64> = hashes
            .iter()
            .map(|hash| chain.get_block_info(hash).unwrap().unwrap().height)
            .collect();
        prop_assert!(heights.windows(2).all(|pair| pair[0] > pair[1]));
        // Dense head, then exponential steps.
        prop_assert!(hashes.len() <= 12 + (64 - length.leading_zeros()) as usize);
    }
}
