use crate::crypto::{Address, Hash};
use crate::transaction::Transaction;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Header {
    pub parent_hash: Hash,
    pub number: u64,
    /// Seconds since the unix epoch.
    pub timestamp: u64,
    pub coinbase: Address,
    pub difficulty: u32,
    pub nonce: u64,
    pub tx_root: Hash,
    #[serde(default)]
    pub extra: Vec<u8>,
}

impl Header {
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.parent_hash);
        hasher.update(self.number.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.coinbase);
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.tx_root);
        hasher.update((self.extra.len() as u64).to_le_bytes());
        hasher.update(&self.extra);
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Assemble a block, filling in the transaction root.
    pub fn new(mut header: Header, transactions: Vec<Transaction>) -> Self {
        header.tx_root = Block::calculate_tx_root(&transactions);
        Block { header, transactions }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn calculate_tx_root(transactions: &[Transaction]) -> Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            hasher.update(tx.hash());
        }
        hasher.finalize().into()
    }

    /// Target a block hash must not exceed for `difficulty` leading zero bits.
    pub fn hash_to_target(difficulty: u32) -> [u8; 32] {
        let mut target = [0xFF; 32];
        let leading_zeros = difficulty / 8;
        let partial_bits = difficulty % 8;

        for item in target.iter_mut().take(leading_zeros as usize) {
            *item = 0;
        }

        if leading_zeros < 32 && partial_bits > 0 {
            target[leading_zeros as usize] = 0xFF >> partial_bits;
        }
        target
    }
}
