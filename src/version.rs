//! Schema version guard for the chain database.

use crate::error::NodeError;
use crate::persistence::KeyValueStore;
use crate::rawdb;
use tracing::{debug, warn};

/// Refuse to run over a database written with another schema version, and
/// stamp `expected` into a fresh or matching one.
pub fn check_and_stamp(store: &dyn KeyValueStore, expected: u64, skip: bool) -> Result<(), NodeError> {
    if skip {
        warn!(expected, "Skipping blockchain version check");
        return Ok(());
    }

    let stored = rawdb::read_blockchain_version(store)?;
    debug!(stored, expected, "Checking blockchain version");
    if stored != 0 && stored != expected {
        return Err(NodeError::VersionMismatch { stored, expected });
    }
    rawdb::write_blockchain_version(store, expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    #[test]
    fn test_fresh_store_is_stamped() {
        let store = MemoryStore::new();
        check_and_stamp(&store, 3, false).unwrap();
        assert_eq!(rawdb::read_blockchain_version(&store).unwrap(), 3);
    }

    #[test]
    fn test_matching_version_is_idempotent() {
        let store = MemoryStore::new();
        rawdb::write_blockchain_version(&store, 3).unwrap();
        check_and_stamp(&store, 3, false).unwrap();
        check_and_stamp(&store, 3, false).unwrap();
        assert_eq!(rawdb::read_blockchain_version(&store).unwrap(), 3);
    }

    #[test]
    fn test_mismatch_fails_without_writing() {
        let store = MemoryStore::new();
        rawdb::write_blockchain_version(&store, 5).unwrap();
        let err = check_and_stamp(&store, 3, false).unwrap_err();
        assert!(matches!(err, NodeError::VersionMismatch { stored: 5, expected: 3 }));
        assert!(err.to_string().contains("upgradedb"));
        assert_eq!(rawdb::read_blockchain_version(&store).unwrap(), 5);
    }

    #[test]
    fn test_skip_leaves_store_alone() {
        let store = MemoryStore::new();
        rawdb::write_blockchain_version(&store, 5).unwrap();
        check_and_stamp(&store, 3, true).unwrap();
        assert_eq!(rawdb::read_blockchain_version(&store).unwrap(), 5);

        let fresh = MemoryStore::new();
        check_and_stamp(&fresh, 3, true).unwrap();
        assert_eq!(rawdb::read_blockchain_version(&fresh).unwrap(), 0);
    }
}
