//! Node configuration loaded from a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use sable_consensus::{ConsensusError, ConsensusParams, Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default mempool budget: 64 MiB of serialized transactions.
pub const DEFAULT_MEMPOOL_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Storage backend selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// sled database under `data_dir`.
    #[default]
    Sled,
    /// Ephemeral in-memory store.
    Memory,
}

/// Runtime configuration of a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding the chain database.
    pub data_dir: PathBuf,
    /// `mainnet`, `testnet` or `regtest`.
    pub network: String,
    /// Mempool byte budget.
    pub mempool_max_bytes: usize,
    /// Storage backend.
    pub storage: StorageKind,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("sable-data"),
            network: Network::Mainnet.to_string(),
            mempool_max_bytes: DEFAULT_MEMPOOL_MAX_BYTES,
            storage: StorageKind::Sled,
        }
    }
}

/// Configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("reading {path}: {source}")]
    Io {
        /// Config file path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid JSON for [`NodeConfig`].
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Unknown network name.
    #[error(transparent)]
    Network(#[from] ConsensusError),
}

impl NodeConfig {
    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Configured network.
    pub fn network(&self) -> Result<Network, ConfigError> {
        Ok(self.network.parse()?)
    }

    /// Consensus parameters of the configured network.
    pub fn consensus_params(&self) -> Result<ConsensusParams, ConfigError> {
        Ok(ConsensusParams::for_network(self.network()?))
    }

    /// sled database location.
    pub fn chain_db_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.chain.db", self.network))
    }
}
