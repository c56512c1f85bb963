//! Genesis definition and reconciliation of the stored chain with the
//! configured one.

use crate::blockchain::{Block, Header};
use crate::crypto::{Hash, ZERO_ADDRESS};
use crate::error::NodeError;
use crate::params::{ChainConfig, Compatibility, ConfigCompatError};
use crate::persistence::{KeyValueStore, WriteBatch};
use crate::rawdb;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};

const MAINNET_GENESIS_TIMESTAMP: u64 = 1_700_000_000;
const MAINNET_GENESIS_EXTRA: &[u8] = b"ledgerd mainnet genesis";
const DEV_CHAIN_ID: u64 = 1337;

/// Founding parameters of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisSpec {
    #[serde(default)]
    pub config: ChainConfig,
    #[serde(default)]
    pub nonce: u64,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, with = "hex_bytes")]
    pub extra_data: Vec<u8>,
    #[serde(default = "default_genesis_difficulty")]
    pub difficulty: u32,
    /// Initial balances keyed by hex address.
    #[serde(default)]
    pub alloc: BTreeMap<String, u128>,
}

fn default_genesis_difficulty() -> u32 {
    1
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        let trimmed = raw.strip_prefix("0x").unwrap_or(&raw);
        hex::decode(trimmed).map_err(serde::de::Error::custom)
    }
}

impl GenesisSpec {
    /// The main network genesis used when nothing else is configured.
    pub fn mainnet() -> Self {
        Self {
            config: ChainConfig::mainnet(),
            nonce: 66,
            timestamp: MAINNET_GENESIS_TIMESTAMP,
            extra_data: MAINNET_GENESIS_EXTRA.to_vec(),
            difficulty: 1,
            alloc: BTreeMap::new(),
        }
    }

    /// Single-node development chain.
    pub fn dev() -> Self {
        Self {
            config: ChainConfig {
                chain_id: DEV_CHAIN_ID,
                ..ChainConfig::mainnet()
            },
            nonce: 0,
            timestamp: 0,
            extra_data: Vec::new(),
            difficulty: 1,
            alloc: BTreeMap::new(),
        }
    }

    fn alloc_root(&self) -> Hash {
        let mut hasher = Sha256::new();
        for (account, balance) in &self.alloc {
            hasher.update(account.as_bytes());
            hasher.update(balance.to_le_bytes());
        }
        hasher.finalize().into()
    }

    pub fn to_block(&self) -> Block {
        Block {
            header: Header {
                parent_hash: [0; 32],
                number: 0,
                timestamp: self.timestamp,
                coinbase: ZERO_ADDRESS,
                difficulty: self.difficulty,
                nonce: self.nonce,
                tx_root: self.alloc_root(),
                extra: self.extra_data.clone(),
            },
            transactions: Vec::new(),
        }
    }

    pub fn hash(&self) -> Hash {
        self.to_block().hash()
    }

    /// Write the genesis block, its canonical mapping, the head marker and the
    /// chain configuration in one batch.
    pub fn commit(&self, store: &dyn KeyValueStore) -> Result<Block, NodeError> {
        let block = self.to_block();
        let mut batch = WriteBatch::new();
        rawdb::write_canonical_block(&mut batch, &block)?;
        rawdb::write_head_height(&mut batch, 0);
        rawdb::stage_chain_config(&mut batch, &block.hash(), &self.config)?;
        store.write_batch(batch)?;
        Ok(block)
    }
}

/// Non-fatal divergence between the stored and the configured chain rules.
/// The node keeps running after rewinding to `rewind_to()` and adopting
/// `upgraded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompatibilityWarning {
    pub error: ConfigCompatError,
    pub upgraded: ChainConfig,
}

impl CompatibilityWarning {
    pub fn rewind_to(&self) -> u64 {
        self.error.rewind_to
    }
}

#[derive(Debug, Clone)]
pub struct GenesisReconciliation {
    pub chain_config: ChainConfig,
    pub genesis_hash: Hash,
    pub compat: Option<CompatibilityWarning>,
}

/// Bring the stored genesis and chain configuration in line with `genesis`.
///
/// A missing genesis is committed (the main network one when `genesis` is
/// `None`). A divergence at or below the stored head is fatal; one above it
/// is reported as a warning. Neither path mutates the store.
pub fn reconcile(
    store: &dyn KeyValueStore,
    genesis: Option<&GenesisSpec>,
) -> Result<GenesisReconciliation, NodeError> {
    let Some(stored) = rawdb::read_canonical_hash(store, 0)? else {
        let spec = match genesis {
            Some(spec) => {
                info!("Writing custom genesis block");
                spec.clone()
            }
            None => {
                info!("Writing default main-net genesis block");
                GenesisSpec::mainnet()
            }
        };
        let block = spec.commit(store)?;
        return Ok(GenesisReconciliation {
            chain_config: spec.config,
            genesis_hash: block.hash(),
            compat: None,
        });
    };

    if let Some(spec) = genesis {
        let hash = spec.hash();
        if hash != stored {
            return Err(NodeError::GenesisMismatch {
                stored: hex::encode(stored),
                new: hex::encode(hash),
            });
        }
    }

    let mainnet_hash = GenesisSpec::mainnet().hash();
    let new_config = match genesis {
        Some(spec) => spec.config.clone(),
        None => ChainConfig::mainnet(),
    };

    let Some(stored_config) = rawdb::read_chain_config(store, &stored)? else {
        warn!(hash = %hex::encode(stored), "Found genesis block without chain config");
        rawdb::write_chain_config(store, &stored, &new_config)?;
        return Ok(GenesisReconciliation {
            chain_config: new_config,
            genesis_hash: stored,
            compat: None,
        });
    };

    // a private network keeps its own rules unless a genesis is supplied
    if genesis.is_none() && stored != mainnet_hash {
        return Ok(GenesisReconciliation {
            chain_config: stored_config,
            genesis_hash: stored,
            compat: None,
        });
    }

    let head = rawdb::read_head_height(store)?
        .ok_or_else(|| NodeError::Database("Missing head height for stored chain".to_string()))?;

    match stored_config.check_compatible(&new_config, head) {
        Compatibility::Compatible => Ok(GenesisReconciliation {
            chain_config: stored_config,
            genesis_hash: stored,
            compat: None,
        }),
        Compatibility::Rewind(error) => Ok(GenesisReconciliation {
            chain_config: stored_config,
            genesis_hash: stored,
            compat: Some(CompatibilityWarning {
                error,
                upgraded: new_config,
            }),
        }),
        Compatibility::Conflict(error) => Err(NodeError::GenesisConflict(error)),
    }
}
