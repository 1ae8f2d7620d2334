//! Fee-ordered queue of candidate transactions for block-template assembly.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::types::{Hash256, Transaction};

#[derive(Debug, Clone)]
struct QueuedTransaction {
    fee: u64,
    /// Arrival order; earlier arrivals win ties.
    sequence: u64,
    hash: Hash256,
    transaction: Transaction,
}

impl PartialEq for QueuedTransaction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTransaction {}

impl PartialOrd for QueuedTransaction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTransaction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fee
            .cmp(&other.fee)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Max-heap by fee, FIFO among equal fees.
#[derive(Debug, Clone, Default)]
pub struct TransactionPriorityQueue {
    heap: BinaryHeap<QueuedTransaction>,
    next_sequence: u64,
}

impl TransactionPriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, hash: Hash256, transaction: Transaction, fee: u64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueuedTransaction {
            fee,
            sequence,
            hash,
            transaction,
        });
    }

    /// Remove the highest-fee transaction as `(hash, transaction, fee)`.
    pub fn dequeue(&mut self) -> Option<(Hash256, Transaction, u64)> {
        self.heap
            .pop()
            .map(|queued| (queued.hash, queued.transaction, queued.fee))
    }

    pub fn peek_fee(&self) -> Option<u64> {
        self.heap.peek().map(|queued| queued.fee)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(lock_time: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time,
        }
    }

    #[test]
    fn dequeues_highest_fee_first() {
        let mut queue = TransactionPriorityQueue::new();
        queue.enqueue(Hash256([1; 32]), tx(1), 10);
        queue.enqueue(Hash256([2; 32]), tx(2), 30);
        queue.enqueue(Hash256([3; 32]), tx(3), 20);

        assert_eq!(queue.peek_fee(), Some(30));
        let fees: Vec<u64> = std::iter::from_fn(|| queue.dequeue().map(|(_, _, fee)| fee)).collect();
        assert_eq!(fees, vec![30, 20, 10]);
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_fees_keep_arrival_order() {
        let mut queue = TransactionPriorityQueue::new();
        for seed in 1..=4u8 {
            queue.enqueue(Hash256([seed; 32]), tx(seed as u32), 5);
        }
        let order: Vec<u8> = std::iter::from_fn(|| queue.dequeue().map(|(h, _, _)| h.0[0])).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }
}
