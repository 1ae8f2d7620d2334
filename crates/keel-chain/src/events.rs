//! Chain events queued during a mutation and delivered after commit.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use keel_core::traits::ChainEventListener;
use keel_core::types::{ChainBlock, Hash256, Transaction};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainEvent {
    /// Confirmed in `chain_block` at `transaction_index`, or pooled when both are `None`.
    NewTransaction {
        hash: Hash256,
        transaction: Transaction,
        chain_block: Option<ChainBlock>,
        transaction_index: Option<u32>,
    },
    RemoveTransaction {
        hash: Hash256,
        transaction: Transaction,
    },
}

impl ChainEvent {
    pub fn hash(&self) -> &Hash256 {
        match self {
            ChainEvent::NewTransaction { hash, .. } | ChainEvent::RemoveTransaction { hash, .. } => hash,
        }
    }
}

/// Deliver `events` in order to every listener.
///
/// A panicking listener is logged at warn and the remaining deliveries
/// continue. Chain state is already committed at this point.
pub fn dispatch(listeners: &[Arc<dyn ChainEventListener>], events: &[ChainEvent]) {
    if listeners.is_empty() {
        return;
    }
    for event in events {
        for listener in listeners {
            let delivered = catch_unwind(AssertUnwindSafe(|| match event {
                ChainEvent::NewTransaction {
                    hash,
                    transaction,
                    chain_block,
                    transaction_index,
                } => listener.on_new_transaction(hash, transaction, chain_block.as_ref(), *transaction_index),
                ChainEvent::RemoveTransaction { hash, transaction } => {
                    listener.on_remove_transaction(hash, transaction)
                }
            }));
            if delivered.is_err() {
                warn!(tx = %event.hash(), "chain event listener panicked");
            }
        }
    }
}
