//! Typed accessors for the records the node keeps in its key-value store.

use crate::blockchain::{Block, Header};
use crate::crypto::Hash;
use crate::error::NodeError;
use crate::params::ChainConfig;
use crate::persistence::{KeyValueStore, WriteBatch};
use crate::transaction::Transaction;

const BLOCKCHAIN_VERSION_KEY: &[u8] = b"BlockchainVersion";
const HEAD_HEIGHT_KEY: &[u8] = b"LastHeaderHeight";
const CANONICAL_PREFIX: &[u8] = b"h";
const HEADER_PREFIX: &[u8] = b"H";
const BODY_PREFIX: &[u8] = b"b";
const CHAIN_CONFIG_PREFIX: &[u8] = b"chain-config-";
const SNAPSHOT_PREFIX: &[u8] = b"consensus-snapshot-";

fn canonical_key(number: u64) -> Vec<u8> {
    let mut key = CANONICAL_PREFIX.to_vec();
    key.extend_from_slice(&number.to_be_bytes());
    key.push(b'n');
    key
}

fn header_key(hash: &Hash) -> Vec<u8> {
    [HEADER_PREFIX, hash.as_slice()].concat()
}

fn body_key(hash: &Hash) -> Vec<u8> {
    [BODY_PREFIX, hash.as_slice()].concat()
}

fn chain_config_key(genesis: &Hash) -> Vec<u8> {
    [CHAIN_CONFIG_PREFIX, genesis.as_slice()].concat()
}

fn snapshot_key(engine: &str) -> Vec<u8> {
    [SNAPSHOT_PREFIX, engine.as_bytes()].concat()
}

fn decode_u64(bytes: &[u8], what: &str) -> Result<u64, NodeError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| NodeError::Database(format!("Malformed {} record ({} bytes)", what, bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Stored schema version; an absent record reads as 0.
pub fn read_blockchain_version(store: &dyn KeyValueStore) -> Result<u64, NodeError> {
    match store.get(BLOCKCHAIN_VERSION_KEY)? {
        Some(bytes) => decode_u64(&bytes, "schema version"),
        None => Ok(0),
    }
}

pub fn write_blockchain_version(store: &dyn KeyValueStore, version: u64) -> Result<(), NodeError> {
    store.put(BLOCKCHAIN_VERSION_KEY, &version.to_be_bytes())
}

pub fn read_head_height(store: &dyn KeyValueStore) -> Result<Option<u64>, NodeError> {
    store
        .get(HEAD_HEIGHT_KEY)?
        .map(|bytes| decode_u64(&bytes, "head height"))
        .transpose()
}

pub fn write_head_height(batch: &mut WriteBatch, number: u64) {
    batch.put(HEAD_HEIGHT_KEY, number.to_be_bytes());
}

pub fn read_canonical_hash(store: &dyn KeyValueStore, number: u64) -> Result<Option<Hash>, NodeError> {
    match store.get(&canonical_key(number))? {
        Some(bytes) => {
            let hash: Hash = bytes.as_slice().try_into().map_err(|_| {
                NodeError::Database(format!("Malformed canonical hash at height {}", number))
            })?;
            Ok(Some(hash))
        }
        None => Ok(None),
    }
}

pub fn read_header(store: &dyn KeyValueStore, hash: &Hash) -> Result<Option<Header>, NodeError> {
    store
        .get(&header_key(hash))?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(NodeError::from))
        .transpose()
}

pub fn read_body(store: &dyn KeyValueStore, hash: &Hash) -> Result<Option<Vec<Transaction>>, NodeError> {
    store
        .get(&body_key(hash))?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(NodeError::from))
        .transpose()
}

/// Stage a block as the canonical block at its height.
pub fn write_canonical_block(batch: &mut WriteBatch, block: &Block) -> Result<(), NodeError> {
    let hash = block.hash();
    batch.put(header_key(&hash), serde_json::to_vec(&block.header)?);
    batch.put(body_key(&hash), serde_json::to_vec(&block.transactions)?);
    batch.put(canonical_key(block.header.number), hash.to_vec());
    Ok(())
}

/// Stage removal of the canonical block at `number`.
pub fn delete_canonical_block(batch: &mut WriteBatch, number: u64, hash: &Hash) {
    batch.delete(header_key(hash));
    batch.delete(body_key(hash));
    batch.delete(canonical_key(number));
}

pub fn read_chain_config(store: &dyn KeyValueStore, genesis: &Hash) -> Result<Option<ChainConfig>, NodeError> {
    store
        .get(&chain_config_key(genesis))?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(NodeError::from))
        .transpose()
}

pub fn write_chain_config(store: &dyn KeyValueStore, genesis: &Hash, config: &ChainConfig) -> Result<(), NodeError> {
    store.put(&chain_config_key(genesis), &serde_json::to_vec(config)?)
}

pub fn stage_chain_config(batch: &mut WriteBatch, genesis: &Hash, config: &ChainConfig) -> Result<(), NodeError> {
    batch.put(chain_config_key(genesis), serde_json::to_vec(config)?);
    Ok(())
}

pub fn read_consensus_snapshot(store: &dyn KeyValueStore, engine: &str) -> Result<Option<Vec<u8>>, NodeError> {
    store.get(&snapshot_key(engine))
}

pub fn write_consensus_snapshot(store: &dyn KeyValueStore, engine: &str, blob: &[u8]) -> Result<(), NodeError> {
    store.put(&snapshot_key(engine), blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[test]
    fn test_missing_version_reads_as_zero() {
        let store = MemoryStore::new();
        assert_eq!(read_blockchain_version(&store).unwrap(), 0);
        write_blockchain_version(&store, 3).unwrap();
        assert_eq!(read_blockchain_version(&store).unwrap(), 3);
    }

    #[test]
    fn test_malformed_version_is_an_error() {
        let store = MemoryStore::new();
        store.put(BLOCKCHAIN_VERSION_KEY, b"3").unwrap();
        assert!(matches!(read_blockchain_version(&store), Err(NodeError::Database(_))));
    }

    #[test]
    fn test_canonical_keys_sort_by_height() {
        assert!(canonical_key(9) < canonical_key(10));
        assert!(canonical_key(255) < canonical_key(256));
    }

    #[test]
    fn test_chain_config_is_keyed_by_genesis() {
        let store = MemoryStore::new();
        let a = [1u8; 32];
        let b = [2u8; 32];
        write_chain_config(&store, &a, &ChainConfig::mainnet()).unwrap();
        assert_eq!(read_chain_config(&store, &a).unwrap(), Some(ChainConfig::mainnet()));
        assert_eq!(read_chain_config(&store, &b).unwrap(), None);
    }
}
