//! Error types for ledgerd

use crate::params::ConfigCompatError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Blockchain DB version mismatch ({stored} / {expected}). Run ledgerd upgradedb.")]
    VersionMismatch { stored: u64, expected: u64 },

    #[error("database already contains an incompatible genesis block (have {stored}, new {new})")]
    GenesisMismatch { stored: String, new: String },

    #[error("incompatible chain configuration: {0}")]
    GenesisConflict(ConfigCompatError),

    #[error("Consensus state error: {0}")]
    ConsensusState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("etherbase address must be explicitly specified")]
    NoEtherbase,

    #[error("etherbase missing: {0}")]
    EtherbaseMissing(Box<NodeError>),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Transaction pool error: {0}")]
    TxPool(String),

    #[error("Mining error: {0}")]
    Mining(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for NodeError {
    fn from(err: rusqlite::Error) -> Self {
        NodeError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for NodeError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        NodeError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for NodeError {
    fn from(err: toml::de::Error) -> Self {
        NodeError::Config(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;
