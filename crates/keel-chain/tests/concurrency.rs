//! Concurrent access to one `Blockchain` from many threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use keel_chain::Blockchain;
use keel_core::merkle;
use keel_core::storage::MemoryStore;
use keel_core::types::{Block, BlockHeader, Hash256, OutPoint, Transaction, TxInput, TxOutput};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_coinbase(height: u64, outputs: usize) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            unlocking_script: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: (0..outputs)
            .map(|_| TxOutput {
                value: 50,
                locking_script: vec![],
            })
            .collect(),
        lock_time: 0,
    }
}

fn make_spend(outpoint: OutPoint, tag: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: outpoint,
            unlocking_script: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput {
            value: 1,
            locking_script: vec![],
        }],
        lock_time: tag,
    }
}

fn make_block(prev_hash: Hash256, height: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: merkle::calculate(&transactions).unwrap(),
            timestamp: height,
            target: u64::MAX,
            nonce: height,
        },
        transactions,
    }
}

/// A coinbase-only block whose chain work is exactly `work`.
fn make_weighted_block(prev_hash: Hash256, tag: u64, work: u64) -> Block {
    let mut block = make_block(prev_hash, tag, vec![make_coinbase(tag, 1)]);
    block.header.target = u64::MAX / work;
    block
}

fn chain_with_genesis(outputs: usize) -> (Arc<Blockchain>, Block) {
    let chain = Arc::new(Blockchain::open_with_defaults(Arc::new(MemoryStore::new())).unwrap());
    let genesis = make_block(Hash256::ZERO, 0, vec![make_coinbase(0, outputs)]);
    assert!(chain.put_block(&genesis.hash(), &genesis).unwrap());
    (chain, genesis)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn racing_double_spends_admit_exactly_one() {
    let (chain, genesis) = chain_with_genesis(1);
    let outpoint = OutPoint {
        txid: genesis.transactions[0].hash(),
        index: 0,
    };
    let admitted = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..16u32)
        .map(|tag| {
            let chain = Arc::clone(&chain);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let tx = make_spend(outpoint, tag);
                if chain.put_transaction(&tx.hash(), &tx).is_ok() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 1);
    assert_eq!(chain.pool_size().unwrap(), 1);
}

#[test]
fn disjoint_spends_all_admitted_concurrently() {
    let (chain, genesis) = chain_with_genesis(32);
    let txid = genesis.transactions[0].hash();

    let handles: Vec<_> = (0..32u32)
        .map(|index| {
            let chain = Arc::clone(&chain);
            thread::spawn(move || {
                let tx = make_spend(OutPoint { txid, index }, index);
                chain.put_transaction(&tx.hash(), &tx).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    // Every slot of the parent ended up claimed: no lost updates.
    assert_eq!(chain.pool_size().unwrap(), 32);
    for index in 0..32u32 {
        let rival = make_spend(OutPoint { txid, index }, 1000 + index);
        assert!(chain.put_transaction(&rival.hash(), &rival).is_err());
    }
}

#[test]
fn blocks_and_transactions_interleave() {
    let (chain, genesis) = chain_with_genesis(8);
    let txid = genesis.transactions[0].hash();

    let miner = {
        let chain = Arc::clone(&chain);
        let genesis_hash = genesis.hash();
        thread::spawn(move || {
            let mut prev = genesis_hash;
            for height in 1..=20 {
                let block = make_block(prev, height, vec![make_coinbase(height, 1)]);
                prev = block.hash();
                assert!(chain.put_block(&prev, &block).unwrap());
            }
        })
    };
    let spenders: Vec<_> = (0..8u32)
        .map(|index| {
            let chain = Arc::clone(&chain);
            thread::spawn(move || {
                let tx = make_spend(OutPoint { txid, index }, index);
                chain.put_transaction(&tx.hash(), &tx).unwrap();
            })
        })
        .collect();

    miner.join().unwrap();
    for handle in spenders {
        handle.join().unwrap();
    }
    assert_eq!(chain.get_best_height(), Some(20));
    assert_eq!(chain.pool_size().unwrap(), 8);
}

#[test]
fn locator_survives_reorgs_to_shorter_branches() {
    let (chain, genesis) = chain_with_genesis(1);
    let fork_point = genesis.hash();

    // Each round swaps a long light branch for a one-block heavy one, so the
    // tip height drops from 20 to 1 and climbs back.
    let miner = {
        let chain = Arc::clone(&chain);
        thread::spawn(move || {
            for round in 1..=12u64 {
                let heavy = make_weighted_block(fork_point, round * 1_000, 1 << (10 + round));
                assert!(chain.put_block(&heavy.hash(), &heavy).unwrap());
                assert_eq!(chain.get_best_height(), Some(1));
                let mut prev = heavy.hash();
                for step in 1..=19 {
                    let block = make_weighted_block(prev, round * 1_000 + step, 1);
                    prev = block.hash();
                    assert!(chain.put_block(&prev, &block).unwrap());
                }
            }
        })
    };

    loop {
        let finished = miner.is_finished();
        let locator = chain.locator().get_locator_hashes().unwrap();
        assert_eq!(locator.last(), Some(&fork_point));
        let hashes = chain.locator().get_hashes(&locator, &Hash256::ZERO, 500).unwrap();
        assert!(!hashes.is_empty());
        if finished {
            break;
        }
    }
    miner.join().unwrap();
    assert_eq!(chain.get_best_height(), Some(20));
}
