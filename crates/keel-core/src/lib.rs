//! # keel-core
//! Ledger types, storage abstraction and collaborator contracts for the
//! Keel chain-state engine.

pub mod error;
pub mod merkle;
pub mod output_set;
pub mod priority_queue;
pub mod storage;
pub mod traits;
pub mod types;
pub mod validation;
