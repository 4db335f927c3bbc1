//! Node configuration.
//!
//! [`NodeConfig`] carries everything the node composition needs: the
//! data directory, log level, the live-accounting switch, and network
//! parameters including an optional hex-encoded genesis block override
//! for private test networks. Loadable from a config file (TOML/JSON,
//! via the `config` crate) with programmatic overrides on top.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use galena_core::constants::{DEFAULT_P2P_PORT, MAGIC_BYTES};
use galena_core::error::CodecError;
use galena_core::genesis;
use galena_core::types::Block;

/// Errors raised while loading or interpreting configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file: {0}")]
    File(#[from] config::ConfigError),
    #[error("genesis override is not valid hex")]
    GenesisHex,
    #[error("genesis override: {0}")]
    GenesisDecode(#[from] CodecError),
}

/// Network parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Wire magic prefix.
    pub magic: [u8; 4],
    /// P2P listen port.
    pub p2p_port: u16,
    /// Seed peer addresses to dial on startup.
    pub seeds: Vec<String>,
    /// Hex-encoded consensus serialization of a genesis block,
    /// overriding the built-in one.
    pub genesis: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            magic: MAGIC_BYTES,
            p2p_port: DEFAULT_P2P_PORT,
            seeds: Vec::new(),
            genesis: None,
        }
    }
}

/// Configuration for a full node instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "galena_node=debug").
    pub log_level: String,
    /// Maintain and emit the per-address accounting index.
    pub live_accounting: bool,
    /// Network parameters.
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("galena");
        Self {
            data_dir,
            log_level: "info".to_string(),
            live_accounting: false,
            network: NetworkConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a file, with defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let loaded = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(loaded)
    }

    /// Path to the chain database directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("chaindata")
    }

    /// The genesis block for the selected network: the configured
    /// override when present, else the built-in one.
    pub fn genesis_block(&self) -> Result<Block, ConfigError> {
        match &self.network.genesis {
            Some(hex_block) => {
                let bytes = hex::decode(hex_block).map_err(|_| ConfigError::GenesisHex)?;
                Ok(Block::from_bytes(&bytes)?)
            }
            None => Ok(genesis::genesis_block().clone()),
        }
    }
}
