//! Configuration management for Holdchain

use crate::crypto::is_valid_public_key;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Public key for secret key 1 (the curve generator). Only suitable for local devnets.
pub const DEVNET_GENESIS_KEY: &str =
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub miner: MinerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_p2p_port")]
    pub p2p_port: u16,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Seconds between automatic chain requests; 0 disables auto-sync.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Idle seconds before a connection sends a ping.
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            p2p_port: default_p2p_port(),
            bootstrap_peers: Vec::new(),
            sync_interval_secs: default_sync_interval(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Snapshot,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,
    /// Hex public key credited by the genesis block. Must match across the network.
    #[serde(default = "default_genesis_key")]
    pub genesis_key: String,
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default)]
    pub backend: StorageBackend,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            genesis_key: default_genesis_key(),
            snapshot_path: default_snapshot_path(),
            backend: StorageBackend::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between integrity checks; 0 disables the monitor.
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Hex public key credited with rewards mined by this node.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub max_transactions: Option<usize>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.ledger.difficulty > 64 {
            return Err(ChainError::ConfigError(format!(
                "ledger.difficulty must be at most 64, got {}",
                self.ledger.difficulty
            )));
        }
        if self.ledger.snapshot_path.trim().is_empty() {
            return Err(ChainError::ConfigError(
                "ledger.snapshot_path must be set in config.toml".to_string(),
            ));
        }
        if !is_valid_public_key(&self.ledger.genesis_key) {
            return Err(ChainError::ConfigError(
                "ledger.genesis_key is not a valid public key".to_string(),
            ));
        }
        if let Some(key) = &self.miner.public_key {
            if !is_valid_public_key(key) {
                return Err(ChainError::ConfigError(
                    "miner.public_key is not a valid public key".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Parse and validate a configuration string.
pub fn parse_config(contents: &str) -> Result<Config, ChainError> {
    let config: Config = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

/// Load `path`; a missing file yields the defaults.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ChainError> {
    let path = path.as_ref();
    if !path.exists() {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path)?;
    parse_config(&contents)
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_p2p_port() -> u16 {
    6000
}

fn default_sync_interval() -> u64 {
    30
}

fn default_heartbeat() -> u64 {
    30
}

fn default_difficulty() -> usize {
    2
}

fn default_genesis_key() -> String {
    DEVNET_GENESIS_KEY.to_string()
}

fn default_snapshot_path() -> String {
    "./data/holdchain.json".to_string()
}

fn default_monitor_interval() -> u64 {
    10
}
