//! # keel-node
//!
//! Composes the chain engine into a process-level component:
//! - [`storage::RocksStore`]: persistent `KeyValueStore` backed by RocksDB
//! - [`node::Node`]: owns one store and one `Blockchain`
//! - [`config::NodeConfig`]: defaults, TOML file and environment overrides
//! - [`logging::init_logging`]: tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod storage;

pub use config::{LogFormat, NodeConfig};
pub use error::NodeError;
pub use logging::init_logging;
pub use node::Node;
pub use storage::RocksStore;
