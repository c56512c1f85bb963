//! Configuration management for ledgerd

use crate::consensus::PowMode;
use crate::crypto::{address_from_hex, Address, ZERO_ADDRESS};
use crate::error::NodeError;
use crate::genesis::GenesisSpec;
use crate::txpool::TxPoolConfig;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings the node service is built from. Never mutated after loading;
/// runtime-adjustable values (etherbase, gas price) are copied out at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeConfig {
    /// Genesis to initialize or check against; `None` selects the main network.
    #[serde(default)]
    pub genesis: Option<GenesisSpec>,
    #[serde(default = "default_gas_price")]
    pub gas_price: u128,
    /// Miner extra-data; empty selects the client default.
    #[serde(default)]
    pub extra_data: String,
    #[serde(default)]
    pub tx_pool: TxPoolConfig,
    /// Database cache in MiB.
    #[serde(default = "default_database_cache")]
    pub database_cache: usize,
    #[serde(default = "default_database_handles")]
    pub database_handles: usize,
    #[serde(default)]
    pub skip_bc_version_check: bool,
    /// Hex mining address; empty means unset.
    #[serde(default)]
    pub etherbase: String,
    #[serde(default)]
    pub enable_preimage_recording: bool,
    #[serde(default)]
    pub pow_mode: PowMode,
    #[serde(default = "default_recommit", deserialize_with = "deserialize_duration")]
    pub miner_recommit: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            genesis: None,
            gas_price: default_gas_price(),
            extra_data: String::new(),
            tx_pool: TxPoolConfig::default(),
            database_cache: default_database_cache(),
            database_handles: default_database_handles(),
            skip_bc_version_check: false,
            etherbase: String::new(),
            enable_preimage_recording: false,
            pow_mode: PowMode::default(),
            miner_recommit: default_recommit(),
        }
    }
}

impl NodeConfig {
    /// Configured mining address; zero when unset.
    pub fn etherbase_address(&self) -> Result<Address, NodeError> {
        if self.etherbase.trim().is_empty() {
            return Ok(ZERO_ADDRESS);
        }
        address_from_hex(self.etherbase.trim())
    }

    fn validate(&self) -> Result<(), NodeError> {
        self.etherbase_address()
            .map_err(|e| NodeError::Config(format!("etherbase: {}", e)))?;
        if self.tx_pool.global_slots == 0 {
            return Err(NodeError::Config("tx_pool.global_slots must be positive".to_string()));
        }
        if self.miner_recommit.is_zero() {
            return Err(NodeError::Config("miner_recommit must be positive".to_string()));
        }
        Ok(())
    }
}

fn default_gas_price() -> u128 {
    1_000_000_000
}

fn default_database_cache() -> usize {
    768
}

fn default_database_handles() -> usize {
    512
}

fn default_recommit() -> Duration {
    Duration::from_secs(3)
}

/// Parse a human-readable duration such as `"3s"` or `"2h 30m"`.
pub fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Load the node configuration from `path`, falling back to defaults when the
/// file is absent.
pub fn load_config(path: &Path) -> Result<NodeConfig, NodeError> {
    let config = match fs::read_to_string(path) {
        Ok(raw) if !raw.trim().is_empty() => toml::from_str(&raw)?,
        Ok(_) => NodeConfig::default(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => NodeConfig::default(),
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ledgerd"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}
