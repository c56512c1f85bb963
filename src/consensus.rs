//! Consensus engines and the selector that builds one from configuration.
//!
//! Three families are supported:
//! - [`Ipos`] - stake-weighted producer rotation (the default)
//! - [`Ethash`] - hash-based proof-of-work
//! - [`Clique`] - permissioned signer set
//!
//! Engines that keep state (validator or signer sets) persist it in the node
//! database under a per-engine snapshot key.

pub mod clique;
pub mod ethash;
pub mod ipos;

pub use clique::{Clique, SignerSnapshot};
pub use ethash::{Ethash, PowMode};
pub use ipos::{Ipos, StakeSnapshot};

use crate::blockchain::{Block, Header};
use crate::config::NodeConfig;
use crate::crypto::Address;
use crate::error::NodeError;
use crate::params::{ChainConfig, EngineConfig, MAXIMUM_EXTRA_DATA_SIZE};
use crate::persistence::KeyValueStore;
use crate::rawdb;
use serde::de::DeserializeOwned;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

/// Block verification and sealing rules of a consensus family.
pub trait ConsensusEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Account credited for producing `header`.
    fn author(&self, header: &Header) -> Address {
        header.coinbase
    }

    /// Check `header` against its parent under this engine's rules.
    fn verify_header(&self, parent: &Header, header: &Header) -> Result<(), NodeError>;

    /// Fill in the consensus fields of a header about to be sealed.
    fn prepare(&self, parent: &Header, header: &mut Header) -> Result<(), NodeError>;

    /// Produce a sealed block. Returns `Ok(None)` if `stop` was raised first.
    fn seal(&self, block: Block, stop: &AtomicBool) -> Result<Option<Block>, NodeError>;
}

/// Checks shared by every engine: height, timestamp and extra-data bounds.
pub(crate) fn verify_common(parent: &Header, header: &Header) -> Result<(), NodeError> {
    if header.number != parent.number + 1 {
        return Err(NodeError::InvalidBlock(format!(
            "non-contiguous header: parent {} child {}",
            parent.number, header.number
        )));
    }
    if header.timestamp <= parent.timestamp {
        return Err(NodeError::InvalidBlock(format!(
            "timestamp {} not after parent timestamp {}",
            header.timestamp, parent.timestamp
        )));
    }
    if header.extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
        return Err(NodeError::InvalidBlock(format!(
            "extra-data too long: {} > {}",
            header.extra.len(),
            MAXIMUM_EXTRA_DATA_SIZE
        )));
    }
    Ok(())
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Load an engine snapshot; a record that does not decode is fatal.
pub(crate) fn load_snapshot<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    engine: &str,
) -> Result<Option<T>, NodeError> {
    let Some(blob) = rawdb::read_consensus_snapshot(store, engine)? else {
        return Ok(None);
    };
    serde_json::from_slice(&blob).map(Some).map_err(|e| {
        NodeError::ConsensusState(format!("malformed {} snapshot: {}", engine, e))
    })
}

/// Build the engine the chain configuration asks for.
pub fn create_consensus_engine(
    config: &NodeConfig,
    chain_config: &ChainConfig,
    store: Arc<dyn KeyValueStore>,
) -> Result<Arc<dyn ConsensusEngine>, NodeError> {
    let engine_config = chain_config.engine_config();
    info!(engine = engine_config.name(), "Creating consensus engine");

    let engine: Arc<dyn ConsensusEngine> = match engine_config {
        EngineConfig::Ipos => Arc::new(Ipos::new(&*store)?),
        EngineConfig::Ethash { difficulty } => Arc::new(Ethash::new(difficulty, config.pow_mode)),
        EngineConfig::Clique { period } => Arc::new(Clique::new(&*store, period)?),
    };
    Ok(engine)
}
