//! # keel-chain
//! Chain-state engine: best-chain selection, UTXO linkage, reorganization,
//! the transaction pool and the orphanages.

pub mod block_magnet;
pub mod blockchain;
pub mod config;
pub mod db;
pub mod events;
pub mod locator;
pub mod orphanage;
pub mod pool;
pub mod stripes;
pub mod transaction_magnet;

pub use blockchain::{BestBlock, BlockAcceptance, Blockchain, TransactionAcceptance};
pub use config::ChainConfig;
