use super::{load_snapshot, now_secs, verify_common, ConsensusEngine};
use crate::blockchain::{Block, Header};
use crate::crypto::{address_to_hex, Address};
use crate::error::NodeError;
use crate::persistence::KeyValueStore;
use crate::rawdb;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const ENGINE_NAME: &str = "ipos";

const DIFF_IN_TURN: u32 = 2;
const DIFF_NO_TURN: u32 = 1;

/// Validator set of the stake engine. Producers rotate through it by height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeSnapshot {
    pub validators: Vec<Address>,
}

impl StakeSnapshot {
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), NodeError> {
        rawdb::write_consensus_snapshot(store, ENGINE_NAME, &serde_json::to_vec(self)?)
    }

    /// Validator expected to produce block `number`, if any are registered.
    pub fn in_turn(&self, number: u64) -> Option<&Address> {
        if self.validators.is_empty() {
            return None;
        }
        self.validators.get((number % self.validators.len() as u64) as usize)
    }
}

/// Stake-weighted producer rotation. An empty validator set leaves block
/// production open to any account.
pub struct Ipos {
    snapshot: StakeSnapshot,
}

impl Ipos {
    pub fn new(store: &dyn KeyValueStore) -> Result<Self, NodeError> {
        let snapshot: StakeSnapshot = load_snapshot(store, ENGINE_NAME)?.unwrap_or_default();
        debug!(validators = snapshot.validators.len(), "Loaded stake snapshot");
        Ok(Self { snapshot })
    }

    pub fn snapshot(&self) -> &StakeSnapshot {
        &self.snapshot
    }

    fn expected_difficulty(&self, number: u64, producer: &Address) -> u32 {
        match self.snapshot.in_turn(number) {
            Some(expected) if expected != producer => DIFF_NO_TURN,
            _ => DIFF_IN_TURN,
        }
    }
}

impl ConsensusEngine for Ipos {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn verify_header(&self, parent: &Header, header: &Header) -> Result<(), NodeError> {
        verify_common(parent, header)?;
        if !self.snapshot.validators.is_empty() && !self.snapshot.validators.contains(&header.coinbase) {
            return Err(NodeError::InvalidBlock(format!(
                "producer {} is not a validator",
                address_to_hex(&header.coinbase)
            )));
        }
        let want = self.expected_difficulty(header.number, &header.coinbase);
        if header.difficulty != want {
            return Err(NodeError::InvalidBlock(format!(
                "invalid turn difficulty: have {}, want {}",
                header.difficulty, want
            )));
        }
        Ok(())
    }

    fn prepare(&self, parent: &Header, header: &mut Header) -> Result<(), NodeError> {
        header.difficulty = self.expected_difficulty(header.number, &header.coinbase);
        header.timestamp = now_secs().max(parent.timestamp + 1);
        Ok(())
    }

    fn seal(&self, block: Block, stop: &AtomicBool) -> Result<Option<Block>, NodeError> {
        if stop.load(Ordering::Relaxed) {
            return Ok(None);
        }
        if !self.snapshot.validators.is_empty() && !self.snapshot.validators.contains(&block.header.coinbase) {
            return Err(NodeError::Mining(format!(
                "{} is not a validator",
                address_to_hex(&block.header.coinbase)
            )));
        }
        Ok(Some(block))
    }
}
