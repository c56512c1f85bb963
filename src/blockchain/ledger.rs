use super::block::{Block, Header};
use crate::consensus::ConsensusEngine;
use crate::crypto::Hash;
use crate::error::NodeError;
use crate::event::{ChainEvent, EventMux};
use crate::params::ChainConfig;
use crate::persistence::{KeyValueStore, WriteBatch};
use crate::rawdb;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const HEADER_CACHE_LIMIT: usize = 512;

/// Execution options handed to the ledger. Purely diagnostic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmConfig {
    pub enable_preimage_recording: bool,
}

/// The canonical chain of headers and bodies stored in the node database.
pub struct Ledger {
    store: Arc<dyn KeyValueStore>,
    chain_config: Arc<ChainConfig>,
    engine: Arc<dyn ConsensusEngine>,
    vm_config: VmConfig,
    genesis: Header,
    current: Header,
    header_cache: Mutex<LruCache<u64, Header>>,
    events: Option<EventMux>,
}

impl Ledger {
    /// Open the ledger over a store that already holds a genesis block.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        chain_config: Arc<ChainConfig>,
        engine: Arc<dyn ConsensusEngine>,
        vm_config: VmConfig,
    ) -> Result<Self, NodeError> {
        let genesis = Self::load_canonical(&*store, 0)?
            .ok_or_else(|| NodeError::Database("No genesis block in database".to_string()))?;

        let head = rawdb::read_head_height(&*store)?.unwrap_or(0);
        let current = match Self::load_canonical(&*store, head)? {
            Some(header) => header,
            None => {
                warn!(head, "Head header missing, resetting chain to genesis");
                let mut batch = WriteBatch::new();
                rawdb::write_head_height(&mut batch, 0);
                store.write_batch(batch)?;
                genesis.clone()
            }
        };

        let capacity = NonZeroUsize::new(HEADER_CACHE_LIMIT).unwrap_or(NonZeroUsize::MIN);
        info!(
            number = current.number,
            hash = %hex::encode(current.hash()),
            engine = engine.name(),
            preimages = vm_config.enable_preimage_recording,
            "Loaded most recent local header"
        );

        Ok(Ledger {
            store,
            chain_config,
            engine,
            vm_config,
            genesis,
            current,
            header_cache: Mutex::new(LruCache::new(capacity)),
            events: None,
        })
    }

    /// Post chain head notifications to `events`.
    pub fn with_events(mut self, events: EventMux) -> Self {
        self.events = Some(events);
        self
    }

    fn load_canonical(store: &dyn KeyValueStore, number: u64) -> Result<Option<Header>, NodeError> {
        match rawdb::read_canonical_hash(store, number)? {
            Some(hash) => rawdb::read_header(store, &hash),
            None => Ok(None),
        }
    }

    pub fn chain_config(&self) -> Arc<ChainConfig> {
        self.chain_config.clone()
    }

    /// Swap in a rewritten configuration after an upgrade rewind.
    pub(crate) fn set_chain_config(&mut self, config: Arc<ChainConfig>) {
        self.chain_config = config;
    }

    pub fn engine(&self) -> Arc<dyn ConsensusEngine> {
        self.engine.clone()
    }

    pub fn vm_config(&self) -> VmConfig {
        self.vm_config
    }

    pub fn genesis(&self) -> &Header {
        &self.genesis
    }

    pub fn current_header(&self) -> &Header {
        &self.current
    }

    pub fn height(&self) -> u64 {
        self.current.number
    }

    pub fn header_by_number(&self, number: u64) -> Result<Option<Header>, NodeError> {
        if number > self.current.number {
            return Ok(None);
        }
        if let Some(header) = self.header_cache.lock().get(&number) {
            return Ok(Some(header.clone()));
        }
        let header = Self::load_canonical(&*self.store, number)?;
        if let Some(header) = &header {
            self.header_cache.lock().put(number, header.clone());
        }
        Ok(header)
    }

    pub fn block_by_number(&self, number: u64) -> Result<Option<Block>, NodeError> {
        let Some(header) = self.header_by_number(number)? else {
            return Ok(None);
        };
        let transactions = rawdb::read_body(&*self.store, &header.hash())?.unwrap_or_default();
        Ok(Some(Block { header, transactions }))
    }

    /// Rewind the canonical head to `number`, dropping every block above it.
    /// Heights at or above the current head leave the chain untouched.
    pub fn set_head(&mut self, number: u64) -> Result<(), NodeError> {
        if number >= self.current.number {
            debug!(target = number, head = self.current.number, "Rewind target above head, nothing to do");
            return Ok(());
        }
        warn!(from = self.current.number, to = number, "Rewinding blockchain");

        let mut batch = WriteBatch::new();
        for height in (number + 1)..=self.current.number {
            if let Some(hash) = rawdb::read_canonical_hash(&*self.store, height)? {
                rawdb::delete_canonical_block(&mut batch, height, &hash);
            }
        }
        rawdb::write_head_height(&mut batch, number);
        self.store.write_batch(batch)?;

        self.header_cache.lock().clear();
        self.current = Self::load_canonical(&*self.store, number)?.ok_or_else(|| {
            NodeError::Database(format!("Missing canonical header at height {}", number))
        })?;

        if let Some(events) = &self.events {
            events.post(ChainEvent::ChainRewound {
                number,
                hash: self.current.hash(),
            });
        }
        Ok(())
    }

    /// Append a block on top of the current head.
    pub fn insert_block(&mut self, block: Block) -> Result<Hash, NodeError> {
        let parent = &self.current;
        if block.header.number != parent.number + 1 {
            return Err(NodeError::InvalidBlock(format!(
                "Invalid block height. Expected {}, but got {}.",
                parent.number + 1,
                block.header.number
            )));
        }
        if block.header.parent_hash != parent.hash() {
            return Err(NodeError::InvalidBlock(format!(
                "Invalid parent hash. Expected {}, but got {}.",
                hex::encode(parent.hash()),
                hex::encode(block.header.parent_hash)
            )));
        }
        let expected_root = Block::calculate_tx_root(&block.transactions);
        if expected_root != block.header.tx_root {
            return Err(NodeError::InvalidBlock(format!(
                "Transaction root mismatch. Expected {}, but got {}.",
                hex::encode(expected_root),
                hex::encode(block.header.tx_root)
            )));
        }
        self.engine.verify_header(parent, &block.header)?;

        let mut batch = WriteBatch::new();
        rawdb::write_canonical_block(&mut batch, &block)?;
        rawdb::write_head_height(&mut batch, block.header.number);
        self.store.write_batch(batch)?;

        let hash = block.hash();
        self.header_cache.lock().put(block.header.number, block.header.clone());
        self.current = block.header;

        if let Some(events) = &self.events {
            events.post(ChainEvent::ChainHead {
                number: self.current.number,
                hash,
            });
        }
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Ethash, PowMode};
    use crate::genesis::GenesisSpec;
    use crate::persistence::MemoryStore;

    fn fake_engine() -> Arc<dyn ConsensusEngine> {
        Arc::new(Ethash::new(1, PowMode::Fake))
    }

    fn open_ledger() -> (Arc<dyn KeyValueStore>, Ledger) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let spec = GenesisSpec::dev();
        spec.commit(&*store).unwrap();
        let ledger = Ledger::new(
            store.clone(),
            Arc::new(spec.config.clone()),
            fake_engine(),
            VmConfig::default(),
        )
        .unwrap();
        (store, ledger)
    }

    fn child_of(parent: &Header) -> Block {
        Block::new(
            Header {
                parent_hash: parent.hash(),
                number: parent.number + 1,
                timestamp: parent.timestamp + 1,
                coinbase: [7u8; 32],
                difficulty: 1,
                nonce: 0,
                tx_root: [0; 32],
                extra: vec![],
            },
            vec![],
        )
    }

    fn extend(ledger: &mut Ledger, blocks: u64) {
        for _ in 0..blocks {
            let block = child_of(ledger.current_header());
            ledger.insert_block(block).unwrap();
        }
    }

    #[test]
    fn test_new_ledger_starts_at_genesis() {
        let (_, ledger) = open_ledger();
        assert_eq!(ledger.height(), 0);
        assert_eq!(ledger.current_header(), ledger.genesis());
    }

    #[test]
    fn test_ledger_requires_genesis() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let result = Ledger::new(
            store,
            Arc::new(ChainConfig::mainnet()),
            fake_engine(),
            VmConfig::default(),
        );
        assert!(matches!(result, Err(NodeError::Database(_))));
    }

    #[test]
    fn test_insert_and_reopen() {
        let (store, mut ledger) = open_ledger();
        extend(&mut ledger, 5);
        assert_eq!(ledger.height(), 5);

        let reopened = Ledger::new(
            store,
            ledger.chain_config(),
            fake_engine(),
            VmConfig::default(),
        )
        .unwrap();
        assert_eq!(reopened.height(), 5);
        assert_eq!(reopened.current_header(), ledger.current_header());
    }

    #[test]
    fn test_insert_rejects_wrong_parent() {
        let (_, mut ledger) = open_ledger();
        let mut block = child_of(ledger.current_header());
        block.header.parent_hash = [1u8; 32];
        assert!(matches!(ledger.insert_block(block), Err(NodeError::InvalidBlock(_))));
    }

    #[test]
    fn test_set_head_truncates_above_target() {
        let (store, mut ledger) = open_ledger();
        extend(&mut ledger, 10);

        ledger.set_head(4).unwrap();
        assert_eq!(ledger.height(), 4);
        assert!(ledger.header_by_number(5).unwrap().is_none());
        assert!(rawdb::read_canonical_hash(&*store, 7).unwrap().is_none());
        assert_eq!(rawdb::read_head_height(&*store).unwrap(), Some(4));

        // the chain can grow again from the new head
        extend(&mut ledger, 1);
        assert_eq!(ledger.height(), 5);
    }

    #[test]
    fn test_set_head_above_current_is_noop() {
        let (_, mut ledger) = open_ledger();
        extend(&mut ledger, 3);
        let head = ledger.current_header().clone();
        ledger.set_head(150).unwrap();
        assert_eq!(ledger.current_header(), &head);
    }

    #[tokio::test]
    async fn test_insert_posts_chain_head_event() {
        let (_, ledger) = open_ledger();
        let events = EventMux::new();
        let mut sub = events.subscribe();
        let mut ledger = ledger.with_events(events);
        extend(&mut ledger, 1);

        match sub.recv().await.unwrap() {
            ChainEvent::ChainHead { number, .. } => assert_eq!(number, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
