//! Integration tests for node construction over an on-disk database

use ledgerd::accounts::{AccountManager, KeystoreWallet};
use ledgerd::blockchain::{Block, Header, Ledger, VmConfig};
use ledgerd::config::NodeConfig;
use ledgerd::consensus::{Ethash, PowMode};
use ledgerd::error::NodeError;
use ledgerd::event::ChainEvent;
use ledgerd::genesis::GenesisSpec;
use ledgerd::node::CHAINDATA_NAME;
use ledgerd::params::{EngineConfig, BLOCKCHAIN_VERSION};
use ledgerd::persistence::{KeyValueStore, SqliteStore};
use ledgerd::rawdb;
use ledgerd::service::{Service, ServiceContext};
use ledgerd::NodeService;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn open_store(dir: &Path) -> SqliteStore {
    SqliteStore::open_or_create(&dir.join(CHAINDATA_NAME), 16, 16).unwrap()
}

fn context(dir: &Path) -> ServiceContext {
    ServiceContext::new(dir, Arc::new(AccountManager::new()))
}

/// Proof-of-work dev chain whose seals are accepted without work.
fn pow_genesis(constantinople: Option<u64>) -> GenesisSpec {
    let mut spec = GenesisSpec::dev();
    spec.config.engine = Some(EngineConfig::Ethash { difficulty: 1 });
    spec.config.constantinople_block = constantinople;
    spec
}

fn pow_config(genesis: GenesisSpec) -> NodeConfig {
    NodeConfig {
        genesis: Some(genesis),
        pow_mode: PowMode::Fake,
        miner_recommit: Duration::from_millis(20),
        ..NodeConfig::default()
    }
}

/// Write `genesis` plus `blocks` empty blocks and a version stamp, then close.
fn seed_chain(dir: &Path, genesis: &GenesisSpec, blocks: u64) {
    let store: Arc<dyn KeyValueStore> = Arc::new(open_store(dir));
    rawdb::write_blockchain_version(&*store, BLOCKCHAIN_VERSION).unwrap();
    genesis.commit(&*store).unwrap();

    let mut ledger = Ledger::new(
        store.clone(),
        Arc::new(genesis.config.clone()),
        Arc::new(Ethash::new(1, PowMode::Fake)),
        VmConfig::default(),
    )
    .unwrap();
    for _ in 0..blocks {
        let parent = ledger.current_header().clone();
        let block = Block::new(
            Header {
                parent_hash: parent.hash(),
                number: parent.number + 1,
                timestamp: parent.timestamp + 1,
                coinbase: [1; 32],
                difficulty: 1,
                nonce: 0,
                tx_root: [0; 32],
                extra: vec![],
            },
            vec![],
        );
        ledger.insert_block(block).unwrap();
    }
    store.close().unwrap();
}

fn dump(dir: &Path) -> Vec<(Vec<u8>, Vec<u8>)> {
    let store = open_store(dir);
    let entries = store.iterate_prefix(b"").unwrap();
    store.close().unwrap();
    entries
}

#[test]
fn test_fresh_database_bootstrap() {
    let dir = TempDir::new().unwrap();
    let node = NodeService::new(&context(dir.path()), NodeConfig::default()).unwrap();

    assert_eq!(
        rawdb::read_blockchain_version(&*node.chain_db()).unwrap(),
        BLOCKCHAIN_VERSION
    );
    assert_eq!(node.genesis_hash(), GenesisSpec::mainnet().hash());
    assert_eq!(node.ledger().read().height(), 0);
    assert_eq!(node.engine().name(), "ipos");
    assert!(node.chain_db().metrics().is_some());

    // no configured address and no wallets
    assert!(matches!(
        node.start_mining(true),
        Err(NodeError::EtherbaseMissing(_))
    ));
    node.stop().unwrap();
}

#[test]
fn test_version_mismatch_stops_before_wiring() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        rawdb::write_blockchain_version(&store, 5).unwrap();
        store.close().unwrap();
    }

    match NodeService::new(&context(dir.path()), NodeConfig::default()) {
        Err(NodeError::VersionMismatch { stored, expected }) => {
            assert_eq!(stored, 5);
            assert_eq!(expected, 3);
        }
        Err(other) => panic!("expected version mismatch, got {}", other),
        Ok(_) => panic!("expected version mismatch"),
    }

    // the database was released and nothing was written
    let store = open_store(dir.path());
    assert_eq!(rawdb::read_blockchain_version(&store).unwrap(), 5);
    assert!(rawdb::read_canonical_hash(&store, 0).unwrap().is_none());
}

#[test]
fn test_skip_version_check() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        rawdb::write_blockchain_version(&store, 5).unwrap();
        store.close().unwrap();
    }
    let config = NodeConfig {
        skip_bc_version_check: true,
        ..NodeConfig::default()
    };
    let node = NodeService::new(&context(dir.path()), config).unwrap();
    assert_eq!(rawdb::read_blockchain_version(&*node.chain_db()).unwrap(), 5);
    node.stop().unwrap();
}

#[test]
fn test_future_fork_moved_earlier_is_adopted() {
    let dir = TempDir::new().unwrap();
    seed_chain(dir.path(), &pow_genesis(Some(200)), 100);

    let upgraded = pow_genesis(Some(150));
    let node = NodeService::new(&context(dir.path()), pow_config(upgraded.clone())).unwrap();

    assert_eq!(node.chain_config().constantinople_block, Some(150));
    assert_eq!(node.ledger().read().chain_config().constantinople_block, Some(150));
    assert_eq!(node.tx_pool().chain_config().constantinople_block, Some(150));
    // the divergence is above the head, so no block is dropped
    assert_eq!(node.ledger().read().height(), 100);
    assert_eq!(
        rawdb::read_chain_config(&*node.chain_db(), &node.genesis_hash()).unwrap(),
        Some(upgraded.config)
    );
    node.stop().unwrap();
}

#[test]
fn test_conflicting_config_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    seed_chain(dir.path(), &pow_genesis(Some(50)), 100);
    let before = dump(dir.path());

    let result = NodeService::new(&context(dir.path()), pow_config(pow_genesis(Some(80))));
    match result {
        Err(NodeError::GenesisConflict(err)) => {
            assert_eq!(err.rewind_to, 50);
            assert_eq!(err.stored, Some(50));
            assert_eq!(err.new, Some(80));
        }
        Err(other) => panic!("expected genesis conflict, got {}", other),
        Ok(_) => panic!("expected genesis conflict"),
    }
    assert_eq!(dump(dir.path()), before);
}

#[test]
fn test_foreign_genesis_is_rejected() {
    let dir = TempDir::new().unwrap();
    seed_chain(dir.path(), &pow_genesis(None), 2);

    let mut foreign = pow_genesis(None);
    foreign.timestamp = 99;
    assert!(matches!(
        NodeService::new(&context(dir.path()), pow_config(foreign)),
        Err(NodeError::GenesisMismatch { .. })
    ));
}

#[test]
fn test_second_node_on_same_directory_fails() {
    let dir = TempDir::new().unwrap();
    let node = NodeService::new(&context(dir.path()), NodeConfig::default()).unwrap();
    assert!(matches!(
        NodeService::new(&context(dir.path()), NodeConfig::default()),
        Err(NodeError::Database(_))
    ));
    node.stop().unwrap();
}

#[test]
fn test_malformed_engine_snapshot_is_fatal() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(dir.path());
        rawdb::write_consensus_snapshot(&store, "ipos", b"[1, 2").unwrap();
        store.close().unwrap();
    }
    assert!(matches!(
        NodeService::new(&context(dir.path()), NodeConfig::default()),
        Err(NodeError::ConsensusState(_))
    ));
}

#[tokio::test]
async fn test_mining_persists_across_restart() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let dir = TempDir::new().unwrap();
        let accounts = AccountManager::new();
        let wallet = Arc::new(KeystoreWallet::open(&dir.path().join("keystore")).unwrap());
        let account = wallet.new_account().unwrap();
        accounts.add_wallet(wallet);
        let ctx = ServiceContext::new(dir.path(), Arc::new(accounts));

        let node = NodeService::new(&ctx, pow_config(pow_genesis(None))).unwrap();
        let mut events = node.event_mux().subscribe();
        node.start_mining(true).unwrap();
        node.start_mining(true).unwrap();
        assert!(node.is_mining());

        let mined = loop {
            if let ChainEvent::NewMinedBlock { number, .. } = events.recv().await.unwrap() {
                break number;
            }
        };
        node.shutdown().await.unwrap();
        assert!(!node.is_mining());

        let head = node.ledger().read().current_header().clone();
        assert!(head.number >= mined);
        assert_eq!(head.coinbase, account.address);

        let reopened = NodeService::new(&ctx, pow_config(pow_genesis(None))).unwrap();
        assert_eq!(reopened.ledger().read().height(), head.number);
        reopened.stop().unwrap();
    })
    .await
    .expect("test_mining_persists_across_restart timed out");
}
