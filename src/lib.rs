//! ledgerd - bootstrap and lifecycle controller of a blockchain full node
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Storage
//! - [`persistence`] - Key-value store (SQLite), format upgrade, metrics
//! - [`rawdb`] - Typed record accessors
//! - [`version`] - Schema version guard
//!
//! ## Chain
//! - [`params`] - Chain configuration and compatibility checks
//! - [`genesis`] - Genesis definition and reconciliation
//! - [`blockchain`] - Blocks and the canonical ledger
//! - [`transaction`] - Transaction type
//! - [`txpool`] - Pending transaction pool
//!
//! ## Consensus & Mining
//! - [`consensus`] - Engine variants and selection
//! - [`miner`] - Block production loop
//!
//! ## Service
//! - [`service`] - Host/service contract and database provisioning
//! - [`node`] - The node service and mining controller
//! - [`event`] - Event bus
//! - [`accounts`] - Wallets and accounts
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`crypto`] - Addresses and key pairs (secp256k1)
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Storage
// ============================================================================
pub mod persistence;
pub mod rawdb;
pub mod version;

// ============================================================================
// Chain
// ============================================================================
pub mod blockchain;
pub mod genesis;
pub mod params;
pub mod transaction;
pub mod txpool;

// ============================================================================
// Consensus & Mining
// ============================================================================
pub mod consensus;
pub mod miner;

// ============================================================================
// Service
// ============================================================================
pub mod accounts;
pub mod event;
pub mod node;
pub mod service;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod crypto;
pub mod error;

pub use error::{NodeError, Result};
pub use node::NodeService;
