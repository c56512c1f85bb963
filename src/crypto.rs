//! Key material and address helpers

use crate::error::NodeError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    All, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// Shared signing context; creating one is expensive.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// An account address: the SHA-256 hash of a compressed public key.
pub type Address = [u8; 32];

/// Generic 32-byte digest used for block and genesis hashes.
pub type Hash = [u8; 32];

pub const ZERO_ADDRESS: Address = [0u8; 32];

pub fn is_zero_address(addr: &Address) -> bool {
    *addr == ZERO_ADDRESS
}

pub fn address_to_hex(addr: &Address) -> String {
    hex::encode(addr)
}

/// Parse a hex address, with or without a `0x` prefix.
pub fn address_from_hex(hex_str: &str) -> Result<Address, NodeError> {
    let trimmed = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(trimmed)
        .map_err(|e| NodeError::Crypto(format!("Invalid hex address: {}", e)))?;
    if bytes.len() != 32 {
        return Err(NodeError::Crypto(format!(
            "Address must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    bytes
        .try_into()
        .map_err(|_| NodeError::Crypto("Failed to convert bytes into address".to_string()))
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                NodeError::Crypto(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                NodeError::Crypto(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn address(&self) -> Address {
        let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = self.public_key.serialize();
        Sha256::digest(pubkey_bytes).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_hex_roundtrip_accepts_prefix() {
        let addr = KeyPair::generate().address();
        let encoded = format!("0x{}", address_to_hex(&addr));
        assert_eq!(address_from_hex(&encoded).unwrap(), addr);
    }

    #[test]
    fn test_address_from_hex_rejects_short_input() {
        let result = address_from_hex("abcd");
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Address must be 32 bytes"));
    }

    #[test]
    fn test_keypair_address_is_stable() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&keypair.secret_key.secret_bytes()).unwrap();
        assert_eq!(keypair.address(), restored.address());
        assert!(!is_zero_address(&keypair.address()));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }
}
