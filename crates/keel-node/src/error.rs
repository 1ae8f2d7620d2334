use thiserror::Error;

use keel_core::error::{KeelError, StoreError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config: {0}")] Config(String),
    #[error("logging: {0}")] Logging(String),
    #[error("io: {0}")] Io(#[from] std::io::Error),
    #[error(transparent)] Keel(#[from] KeelError),
}

impl From<config::ConfigError> for NodeError {
    fn from(err: config::ConfigError) -> Self {
        NodeError::Config(err.to_string())
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        NodeError::Keel(err.into())
    }
}
