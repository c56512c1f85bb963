use super::{load_snapshot, now_secs, verify_common, ConsensusEngine};
use crate::blockchain::{Block, Header};
use crate::crypto::{address_to_hex, Address};
use crate::error::NodeError;
use crate::persistence::KeyValueStore;
use crate::rawdb;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

const ENGINE_NAME: &str = "clique";

const DIFF_IN_TURN: u32 = 2;
const DIFF_NO_TURN: u32 = 1;

/// Polling step while a seal waits for its slot.
const SEAL_WAIT_STEP: Duration = Duration::from_millis(50);

/// Authorized signers of a permissioned chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSnapshot {
    pub signers: Vec<Address>,
}

impl SignerSnapshot {
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), NodeError> {
        rawdb::write_consensus_snapshot(store, ENGINE_NAME, &serde_json::to_vec(self)?)
    }

    fn authorized(&self, signer: &Address) -> bool {
        self.signers.is_empty() || self.signers.contains(signer)
    }

    fn in_turn(&self, number: u64, signer: &Address) -> bool {
        if self.signers.is_empty() {
            return true;
        }
        let idx = (number % self.signers.len() as u64) as usize;
        self.signers.get(idx) == Some(signer)
    }
}

/// Permissioned signer rotation with a minimum block period.
pub struct Clique {
    period: u64,
    snapshot: SignerSnapshot,
}

impl Clique {
    pub fn new(store: &dyn KeyValueStore, period: u64) -> Result<Self, NodeError> {
        let snapshot: SignerSnapshot = load_snapshot(store, ENGINE_NAME)?.unwrap_or_default();
        debug!(signers = snapshot.signers.len(), period, "Loaded signer snapshot");
        Ok(Self { period, snapshot })
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn snapshot(&self) -> &SignerSnapshot {
        &self.snapshot
    }

    fn difficulty(&self, number: u64, signer: &Address) -> u32 {
        if self.snapshot.in_turn(number, signer) {
            DIFF_IN_TURN
        } else {
            DIFF_NO_TURN
        }
    }
}

impl ConsensusEngine for Clique {
    fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    fn verify_header(&self, parent: &Header, header: &Header) -> Result<(), NodeError> {
        verify_common(parent, header)?;
        if header.timestamp < parent.timestamp + self.period {
            return Err(NodeError::InvalidBlock(format!(
                "block {} sealed before its period elapsed",
                header.number
            )));
        }
        if !self.snapshot.authorized(&header.coinbase) {
            return Err(NodeError::InvalidBlock(format!(
                "unauthorized signer {}",
                address_to_hex(&header.coinbase)
            )));
        }
        let want = self.difficulty(header.number, &header.coinbase);
        if header.difficulty != want {
            return Err(NodeError::InvalidBlock(format!(
                "invalid turn difficulty: have {}, want {}",
                header.difficulty, want
            )));
        }
        Ok(())
    }

    fn prepare(&self, parent: &Header, header: &mut Header) -> Result<(), NodeError> {
        header.difficulty = self.difficulty(header.number, &header.coinbase);
        header.timestamp = now_secs().max(parent.timestamp + self.period.max(1));
        Ok(())
    }

    /// Waits until the header's timestamp is reached, then releases the block.
    fn seal(&self, block: Block, stop: &AtomicBool) -> Result<Option<Block>, NodeError> {
        if !self.snapshot.authorized(&block.header.coinbase) {
            return Err(NodeError::Mining(format!(
                "unauthorized signer {}",
                address_to_hex(&block.header.coinbase)
            )));
        }
        loop {
            if stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if now_secs() >= block.header.timestamp {
                return Ok(Some(block));
            }
            std::thread::sleep(SEAL_WAIT_STEP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    fn header(number: u64, timestamp: u64, coinbase: Address) -> Header {
        Header {
            parent_hash: [0; 32],
            number,
            timestamp,
            coinbase,
            difficulty: DIFF_IN_TURN,
            nonce: 0,
            tx_root: [0; 32],
            extra: vec![],
        }
    }

    #[test]
    fn test_snapshot_is_loaded_from_store() {
        let store = MemoryStore::new();
        SignerSnapshot { signers: vec![[4; 32]] }.save(&store).unwrap();
        let engine = Clique::new(&store, 5).unwrap();
        assert_eq!(engine.snapshot().signers, vec![[4; 32]]);
        assert_eq!(engine.period(), 5);
    }

    #[test]
    fn test_period_is_enforced() {
        let engine = Clique::new(&MemoryStore::new(), 5).unwrap();
        let parent = header(0, 100, [0; 32]);
        assert!(engine.verify_header(&parent, &header(1, 103, [1; 32])).is_err());
        assert!(engine.verify_header(&parent, &header(1, 105, [1; 32])).is_ok());
    }

    #[test]
    fn test_unauthorized_signer_cannot_seal() {
        let store = MemoryStore::new();
        SignerSnapshot { signers: vec![[4; 32]] }.save(&store).unwrap();
        let engine = Clique::new(&store, 1).unwrap();
        let block = Block::new(header(1, 0, [5; 32]), vec![]);
        assert!(matches!(
            engine.seal(block, &AtomicBool::new(false)),
            Err(NodeError::Mining(_))
        ));
    }

    #[test]
    fn test_stop_flag_interrupts_wait() {
        let engine = Clique::new(&MemoryStore::new(), 1).unwrap();
        let block = Block::new(header(1, u64::MAX, [1; 32]), vec![]);
        assert!(engine.seal(block, &AtomicBool::new(true)).unwrap().is_none());
    }
}
