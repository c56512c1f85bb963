//! Block production loop.
//!
//! The miner runs as a tokio task: it assembles a candidate on top of the
//! current head from the pool's pending transactions, hands it to the engine
//! to seal on the blocking pool, and inserts whatever comes back. A watch
//! channel stops the loop between rounds and an abort flag interrupts a seal
//! in progress.

use crate::blockchain::{Block, Header, Ledger};
use crate::consensus::ConsensusEngine;
use crate::crypto::{address_to_hex, Address};
use crate::error::NodeError;
use crate::event::{ChainEvent, EventMux};
use crate::params::{packed_version, MAXIMUM_EXTRA_DATA_SIZE};
use crate::txpool::TxPool;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CLIENT_NAME: &str = "ledgerd";

/// Transactions packed into one block at most.
const MAX_BLOCK_TRANSACTIONS: usize = 512;

/// Extra-data for sealed headers. Empty input selects the client default;
/// anything longer than the header limit is dropped.
pub fn make_extra_data(extra: &[u8]) -> Vec<u8> {
    let extra = if extra.is_empty() {
        bincode::serialize(&(packed_version(), CLIENT_NAME, std::env::consts::OS)).unwrap_or_default()
    } else {
        extra.to_vec()
    };
    if extra.len() > MAXIMUM_EXTRA_DATA_SIZE {
        warn!(
            extra = %hex::encode(&extra),
            limit = MAXIMUM_EXTRA_DATA_SIZE,
            "Miner extra data exceed limit"
        );
        return Vec::new();
    }
    extra
}

struct MinerContext {
    ledger: Arc<RwLock<Ledger>>,
    pool: Arc<TxPool>,
    engine: Arc<dyn ConsensusEngine>,
    events: EventMux,
    recommit: Duration,
    extra: RwLock<Vec<u8>>,
    coinbase: RwLock<Address>,
}

struct Worker {
    stop: watch::Sender<bool>,
    abort: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    local: bool,
}

pub struct Miner {
    ctx: Arc<MinerContext>,
    worker: Mutex<Option<Worker>>,
    stopping: Mutex<Vec<JoinHandle<()>>>,
}

impl Miner {
    pub fn new(
        ledger: Arc<RwLock<Ledger>>,
        pool: Arc<TxPool>,
        engine: Arc<dyn ConsensusEngine>,
        events: EventMux,
        recommit: Duration,
    ) -> Self {
        Self {
            ctx: Arc::new(MinerContext {
                ledger,
                pool,
                engine,
                events,
                recommit,
                extra: RwLock::new(Vec::new()),
                coinbase: RwLock::new([0u8; 32]),
            }),
            worker: Mutex::new(None),
            stopping: Mutex::new(Vec::new()),
        }
    }

    pub fn set_extra(&self, extra: Vec<u8>) {
        *self.ctx.extra.write() = extra;
    }

    pub fn extra(&self) -> Vec<u8> {
        self.ctx.extra.read().clone()
    }

    pub fn coinbase(&self) -> Address {
        *self.ctx.coinbase.read()
    }

    pub fn set_coinbase(&self, coinbase: Address) {
        *self.ctx.coinbase.write() = coinbase;
    }

    /// Start producing blocks for `coinbase`. Returns `Ok(false)` when a
    /// worker is already running; its coinbase is updated instead.
    pub fn start(&self, coinbase: Address, local: bool) -> Result<bool, NodeError> {
        self.set_coinbase(coinbase);

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            debug!(coinbase = %address_to_hex(&coinbase), "Miner already running");
            return Ok(false);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| NodeError::Mining(format!("no async runtime: {}", e)))?;
        let (stop, stop_rx) = watch::channel(false);
        let abort = Arc::new(AtomicBool::new(false));
        let handle = runtime.spawn(run(self.ctx.clone(), stop_rx, abort.clone()));

        info!(coinbase = %address_to_hex(&coinbase), local, "Starting mining operation");
        *worker = Some(Worker {
            stop,
            abort,
            handle,
            local,
        });
        Ok(true)
    }

    /// Signal the worker to stop. Returns at once; see [`Miner::join`].
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort.store(true, Ordering::Relaxed);
            let _ = worker.stop.send(true);
            let mut stopping = self.stopping.lock();
            stopping.retain(|h| !h.is_finished());
            stopping.push(worker.handle);
            info!("Mining stop requested");
        }
    }

    /// Stopped workers not yet joined.
    pub fn stopping(&self) -> usize {
        self.stopping.lock().len()
    }

    /// Wait for every stopped worker to exit.
    pub async fn join(&self) {
        let handles: Vec<_> = self.stopping.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Miner task failed");
            }
        }
    }

    pub fn is_mining(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Whether the running worker was started for local mining.
    pub fn is_local(&self) -> Option<bool> {
        self.worker.lock().as_ref().map(|w| w.local)
    }
}

impl MinerContext {
    fn candidate(&self) -> Result<Block, NodeError> {
        let parent = self.ledger.read().current_header().clone();
        let mut header = Header {
            parent_hash: parent.hash(),
            number: parent.number + 1,
            timestamp: 0,
            coinbase: *self.coinbase.read(),
            difficulty: 0,
            nonce: 0,
            tx_root: [0; 32],
            extra: self.extra.read().clone(),
        };
        self.engine.prepare(&parent, &mut header)?;

        let mut transactions = self.pool.pending();
        transactions.truncate(MAX_BLOCK_TRANSACTIONS);
        Ok(Block::new(header, transactions))
    }

    fn commit(&self, block: Block) {
        let number = block.number();
        let included: Vec<_> = block.transactions.iter().map(|tx| tx.hash()).collect();
        let inserted = self.ledger.write().insert_block(block);
        match inserted {
            Ok(hash) => {
                self.pool.remove(&included);
                self.events.post(ChainEvent::NewMinedBlock { number, hash });
                info!(
                    number,
                    hash = %hex::encode(hash),
                    txs = included.len(),
                    "Successfully sealed new block"
                );
            }
            Err(e) => warn!(number, error = %e, "Discarding sealed block"),
        }
    }
}

async fn run(ctx: Arc<MinerContext>, mut stop: watch::Receiver<bool>, abort: Arc<AtomicBool>) {
    loop {
        if *stop.borrow() {
            break;
        }

        match ctx.candidate() {
            Ok(candidate) => {
                let engine = ctx.engine.clone();
                let flag = abort.clone();
                match tokio::task::spawn_blocking(move || engine.seal(candidate, &flag)).await {
                    Ok(Ok(Some(block))) => ctx.commit(block),
                    Ok(Ok(None)) => debug!("Sealing aborted"),
                    Ok(Err(e)) => warn!(error = %e, "Block sealing failed"),
                    Err(e) => {
                        error!(error = %e, "Sealing task panicked");
                        break;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to prepare block candidate"),
        }

        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(ctx.recommit) => {}
        }
    }
    info!("Miner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::VmConfig;
    use crate::consensus::{Ethash, PowMode};
    use crate::genesis::GenesisSpec;
    use crate::persistence::{KeyValueStore, MemoryStore};
    use crate::txpool::TxPoolConfig;

    fn miner() -> (Arc<RwLock<Ledger>>, EventMux, Miner) {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let spec = GenesisSpec::dev();
        spec.commit(&*store).unwrap();
        let chain = Arc::new(spec.config.clone());
        let engine: Arc<dyn ConsensusEngine> = Arc::new(Ethash::new(1, PowMode::Fake));
        let ledger = Arc::new(RwLock::new(
            Ledger::new(store, chain.clone(), engine.clone(), VmConfig::default()).unwrap(),
        ));
        let pool = Arc::new(
            TxPool::new(
                TxPoolConfig {
                    journal: None,
                    ..TxPoolConfig::default()
                },
                chain,
                ledger.clone(),
            )
            .unwrap(),
        );
        let events = EventMux::new();
        let miner = Miner::new(
            ledger.clone(),
            pool,
            engine,
            events.clone(),
            Duration::from_millis(20),
        );
        (ledger, events, miner)
    }

    #[test]
    fn test_extra_data_passthrough() {
        assert_eq!(make_extra_data(b"pool-7"), b"pool-7".to_vec());
        assert_eq!(make_extra_data(&[1u8; MAXIMUM_EXTRA_DATA_SIZE]).len(), MAXIMUM_EXTRA_DATA_SIZE);
    }

    #[test]
    fn test_oversized_extra_data_is_dropped() {
        assert!(make_extra_data(&[1u8; MAXIMUM_EXTRA_DATA_SIZE + 1]).is_empty());
    }

    #[test]
    fn test_default_extra_data_names_client() {
        let extra = make_extra_data(&[]);
        assert!(extra.len() <= MAXIMUM_EXTRA_DATA_SIZE);
        if !extra.is_empty() {
            let (version, client, _os): (u32, String, String) = bincode::deserialize(&extra).unwrap();
            assert_eq!(version, packed_version());
            assert_eq!(client, CLIENT_NAME);
        }
    }

    #[test]
    fn test_start_requires_runtime() {
        let (_, _, miner) = miner();
        assert!(matches!(miner.start([1; 32], true), Err(NodeError::Mining(_))));
        assert!(!miner.is_mining());
    }

    #[tokio::test]
    async fn test_mines_blocks_until_stopped() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let (ledger, events, miner) = miner();
            let mut sub = events.subscribe();
            assert!(miner.start([5; 32], true).unwrap());
            assert!(miner.is_mining());

            loop {
                if let ChainEvent::NewMinedBlock { number, .. } = sub.recv().await.unwrap() {
                    assert!(number >= 1);
                    break;
                }
            }

            miner.stop();
            miner.join().await;
            assert!(!miner.is_mining());

            let head = ledger.read().current_header().clone();
            assert!(head.number >= 1);
            assert_eq!(head.coinbase, [5; 32]);
        })
        .await
        .expect("test_mines_blocks_until_stopped timed out");
    }

    #[tokio::test]
    async fn test_second_start_updates_coinbase_only() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let (_, _, miner) = miner();
            assert!(miner.start([1; 32], false).unwrap());
            assert!(!miner.start([2; 32], true).unwrap());
            assert_eq!(miner.coinbase(), [2; 32]);
            assert_eq!(miner.is_local(), Some(false));

            miner.stop();
            miner.join().await;
        })
        .await
        .expect("test_second_start_updates_coinbase_only timed out");
    }

    #[tokio::test]
    async fn test_stop_without_join_does_not_accumulate_handles() {
        tokio::time::timeout(Duration::from_secs(10), async {
            let (_, _, miner) = miner();
            for _ in 0..5 {
                assert!(miner.start([3; 32], true).unwrap());
                miner.stop();
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            assert_eq!(miner.stopping(), 1);

            miner.join().await;
            assert_eq!(miner.stopping(), 0);
        })
        .await
        .expect("test_stop_without_join_does_not_accumulate_handles timed out");
    }
}
