//! Transaction type carried by blocks and the transaction pool.

use crate::crypto::{Address, Hash};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas: u64,
    pub value: u128,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Replay-protection domain; required once EIP155 is active.
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.from);
        match &self.to {
            Some(to) => {
                hasher.update([1u8]);
                hasher.update(to);
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.gas_price.to_le_bytes());
        hasher.update(self.gas.to_le_bytes());
        hasher.update(self.value.to_le_bytes());
        hasher.update((self.payload.len() as u64).to_le_bytes());
        hasher.update(&self.payload);
        hasher.update(self.chain_id.unwrap_or_default().to_le_bytes());
        hasher.finalize().into()
    }

    pub fn size(&self) -> usize {
        // fixed fields plus payload
        32 + 33 + 8 + 16 + 8 + 16 + 9 + self.payload.len()
    }
}
