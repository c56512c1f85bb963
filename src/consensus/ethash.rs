use super::{now_secs, verify_common, ConsensusEngine};
use crate::blockchain::{Block, Header};
use crate::error::NodeError;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// How much work the proof-of-work engine demands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowMode {
    #[default]
    Normal,
    /// Difficulty pinned to one bit, for test networks.
    Test,
    /// Seals are accepted without any work.
    Fake,
}

/// Number of nonces tried between checks of the stop flag.
const STOP_CHECK_INTERVAL: u64 = 1024;

pub struct Ethash {
    difficulty: u32,
    mode: PowMode,
}

impl Ethash {
    pub fn new(difficulty: u32, mode: PowMode) -> Self {
        let difficulty = match mode {
            PowMode::Test => 1,
            _ => difficulty.min(255),
        };
        Self { difficulty, mode }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty
    }

    fn meets_target(header: &Header) -> bool {
        header.hash() <= Block::hash_to_target(header.difficulty)
    }
}

impl ConsensusEngine for Ethash {
    fn name(&self) -> &'static str {
        "ethash"
    }

    fn verify_header(&self, parent: &Header, header: &Header) -> Result<(), NodeError> {
        verify_common(parent, header)?;
        if header.difficulty != self.difficulty {
            return Err(NodeError::InvalidBlock(format!(
                "invalid difficulty: have {}, want {}",
                header.difficulty, self.difficulty
            )));
        }
        if self.mode != PowMode::Fake && !Self::meets_target(header) {
            return Err(NodeError::InvalidBlock(
                "Invalid Proof-of-Work: Block hash does not meet difficulty target.".to_string(),
            ));
        }
        Ok(())
    }

    fn prepare(&self, parent: &Header, header: &mut Header) -> Result<(), NodeError> {
        header.difficulty = self.difficulty;
        header.timestamp = now_secs().max(parent.timestamp + 1);
        Ok(())
    }

    fn seal(&self, mut block: Block, stop: &AtomicBool) -> Result<Option<Block>, NodeError> {
        if self.mode == PowMode::Fake {
            return Ok(Some(block));
        }
        let target = Block::hash_to_target(block.header.difficulty);
        for nonce in 0..=u64::MAX {
            if nonce % STOP_CHECK_INTERVAL == 0 && stop.load(Ordering::Relaxed) {
                return Ok(None);
            }
            block.header.nonce = nonce;
            if block.header.hash() <= target {
                return Ok(Some(block));
            }
        }
        Err(NodeError::Mining("nonce space exhausted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent() -> Header {
        Header {
            parent_hash: [0; 32],
            number: 0,
            timestamp: 1_000,
            coinbase: [0; 32],
            difficulty: 1,
            nonce: 0,
            tx_root: [0; 32],
            extra: vec![],
        }
    }

    fn candidate(engine: &Ethash) -> Block {
        let parent = parent();
        let mut header = Header {
            parent_hash: parent.hash(),
            number: 1,
            ..parent.clone()
        };
        engine.prepare(&parent, &mut header).unwrap();
        Block::new(header, vec![])
    }

    #[test]
    fn test_sealed_block_verifies() {
        let engine = Ethash::new(8, PowMode::Normal);
        let sealed = engine
            .seal(candidate(&engine), &AtomicBool::new(false))
            .unwrap()
            .unwrap();
        assert!(engine.verify_header(&parent(), &sealed.header).is_ok());
    }

    #[test]
    fn test_test_mode_pins_difficulty() {
        assert_eq!(Ethash::new(20, PowMode::Test).difficulty(), 1);
    }

    #[test]
    fn test_raised_stop_flag_aborts_seal() {
        let engine = Ethash::new(255, PowMode::Normal);
        let result = engine.seal(candidate(&engine), &AtomicBool::new(true)).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_wrong_difficulty_is_rejected() {
        let engine = Ethash::new(4, PowMode::Fake);
        let mut block = candidate(&engine);
        block.header.difficulty = 5;
        assert!(engine.verify_header(&parent(), &block.header).is_err());
    }
}
