//! Node configuration.
//!
//! [`NodeConfig::load`] layers, lowest priority first: built-in defaults,
//! an optional TOML file, then `KEEL_*` environment variables (nested keys
//! separated by `__`, e.g. `KEEL_CHAIN__LOCK_STRIPES=64`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use keel_chain::ChainConfig;

use crate::error::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log filter directive (e.g. "info", "keel_chain=debug"). `RUST_LOG` wins if set.
    pub log_level: String,
    pub log_format: LogFormat,
    pub chain: ChainConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("keel");

        Self {
            data_dir,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            chain: ChainConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults overlaid with `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, NodeError> {
        let defaults = config::Config::try_from(&NodeConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        let environment = config::Environment::with_prefix("KEEL")
            .prefix_separator("_")
            .separator("__");
        let settings = builder.add_source(environment).build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Path to the RocksDB chain data directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }
}
