//! Pending transaction pool with a journal of local transactions.

use crate::blockchain::Ledger;
use crate::crypto::{Address, Hash};
use crate::error::NodeError;
use crate::params::ChainConfig;
use crate::transaction::Transaction;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Largest transaction the pool accepts.
pub const MAX_TX_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TxPoolConfig {
    /// Journal of local transactions, relative to the data directory unless
    /// absolute. `None` disables journaling.
    pub journal: Option<PathBuf>,
    pub price_limit: u128,
    pub global_slots: usize,
    /// How long a remote transaction may sit in the pool.
    #[serde(deserialize_with = "crate::config::deserialize_duration")]
    pub lifetime: Duration,
    /// Treat local submissions like remote ones.
    pub no_locals: bool,
}

impl Default for TxPoolConfig {
    fn default() -> Self {
        Self {
            journal: Some(PathBuf::from("transactions.journal")),
            price_limit: 1,
            global_slots: 4096,
            lifetime: Duration::from_secs(3 * 60 * 60),
            no_locals: false,
        }
    }
}

struct PoolEntry {
    tx: Transaction,
    local: bool,
    added: Instant,
}

#[derive(Default)]
struct PoolState {
    all: HashMap<Hash, PoolEntry>,
    locals: HashSet<Address>,
}

pub struct TxPool {
    config: TxPoolConfig,
    chain_config: Arc<ChainConfig>,
    ledger: Arc<RwLock<Ledger>>,
    gas_price: RwLock<u128>,
    state: RwLock<PoolState>,
}

impl TxPool {
    /// Build the pool and replay its journal, if one is configured.
    pub fn new(
        config: TxPoolConfig,
        chain_config: Arc<ChainConfig>,
        ledger: Arc<RwLock<Ledger>>,
    ) -> Result<Self, NodeError> {
        let pool = Self {
            gas_price: RwLock::new(config.price_limit),
            config,
            chain_config,
            ledger,
            state: RwLock::new(PoolState::default()),
        };

        if let Some(path) = pool.journal_path() {
            if path.exists() {
                let (loaded, dropped) = pool.load_journal(path)?;
                info!(transactions = loaded, dropped, "Loaded local transaction journal");
            }
        }
        Ok(pool)
    }

    fn journal_path(&self) -> Option<&Path> {
        if self.config.no_locals {
            return None;
        }
        self.config.journal.as_deref()
    }

    fn load_journal(&self, path: &Path) -> Result<(usize, usize), NodeError> {
        let reader = BufReader::new(File::open(path)?);
        let (mut loaded, mut dropped) = (0, 0);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let admitted = serde_json::from_str::<Transaction>(&line)
                .map_err(NodeError::from)
                .and_then(|tx| self.add(tx, true, false));
            match admitted {
                Ok(_) => loaded += 1,
                Err(e) => {
                    debug!(error = %e, "Dropping journaled transaction");
                    dropped += 1;
                }
            }
        }
        Ok((loaded, dropped))
    }

    fn append_journal(&self, tx: &Transaction) -> Result<(), NodeError> {
        let Some(path) = self.journal_path() else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(tx)?)?;
        Ok(())
    }

    /// Rewrite the journal with the local transactions still pending.
    pub fn rotate_journal(&self) -> Result<usize, NodeError> {
        let Some(path) = self.journal_path() else {
            return Ok(0);
        };
        let tmp = path.with_extension("new");
        let count = {
            let state = self.state.read();
            let mut file = File::create(&tmp)?;
            let mut count = 0;
            for entry in state.all.values().filter(|e| e.local) {
                writeln!(file, "{}", serde_json::to_string(&entry.tx)?)?;
                count += 1;
            }
            file.sync_all()?;
            count
        };
        fs::rename(&tmp, path)?;
        debug!(transactions = count, path = %path.display(), "Rotated transaction journal");
        Ok(count)
    }

    pub fn add_local(&self, tx: Transaction) -> Result<Hash, NodeError> {
        let local = !self.config.no_locals;
        self.add(tx, local, local)
    }

    pub fn add_remote(&self, tx: Transaction) -> Result<Hash, NodeError> {
        self.add(tx, false, false)
    }

    fn validate(&self, tx: &Transaction, local: bool) -> Result<(), NodeError> {
        if tx.size() > MAX_TX_SIZE {
            return Err(NodeError::TxPool(format!("oversized data: {} bytes", tx.size())));
        }
        if !local && tx.gas_price < *self.gas_price.read() {
            return Err(NodeError::TxPool("transaction underpriced".to_string()));
        }
        let next = self.ledger.read().height() + 1;
        match tx.chain_id {
            Some(id) if id != self.chain_config.chain_id => {
                return Err(NodeError::TxPool(format!(
                    "invalid chain id: have {}, want {}",
                    id, self.chain_config.chain_id
                )));
            }
            None if self.chain_config.is_eip155(next) => {
                return Err(NodeError::TxPool("replay-protected transaction required".to_string()));
            }
            _ => {}
        }
        Ok(())
    }

    fn add(&self, tx: Transaction, local: bool, journal: bool) -> Result<Hash, NodeError> {
        let hash = tx.hash();
        if self.state.read().all.contains_key(&hash) {
            return Err(NodeError::TxPool(format!("already known: {}", hex::encode(hash))));
        }
        self.validate(&tx, local)?;

        {
            let mut state = self.state.write();
            self.evict_stale(&mut state);
            if state.all.len() >= self.config.global_slots {
                let cheapest = state
                    .all
                    .iter()
                    .filter(|(_, e)| !e.local)
                    .min_by_key(|(_, e)| e.tx.gas_price)
                    .map(|(h, e)| (*h, e.tx.gas_price));
                match cheapest {
                    Some((victim, price)) if local || price < tx.gas_price => {
                        debug!(hash = %hex::encode(victim), "Evicting cheapest remote transaction");
                        state.all.remove(&victim);
                    }
                    _ => return Err(NodeError::TxPool("transaction pool is full".to_string())),
                }
            }
            if local {
                state.locals.insert(tx.from);
            }
            state.all.insert(
                hash,
                PoolEntry {
                    tx: tx.clone(),
                    local,
                    added: Instant::now(),
                },
            );
        }

        if journal {
            if let Err(e) = self.append_journal(&tx) {
                warn!(error = %e, "Failed to journal local transaction");
            }
        }
        Ok(hash)
    }

    fn evict_stale(&self, state: &mut PoolState) {
        let lifetime = self.config.lifetime;
        let before = state.all.len();
        state.all.retain(|_, e| e.local || e.added.elapsed() < lifetime);
        let evicted = before - state.all.len();
        if evicted > 0 {
            debug!(evicted, "Dropped expired remote transactions");
        }
    }

    /// Pending transactions ordered by gas price (highest first), then nonce.
    pub fn pending(&self) -> Vec<Transaction> {
        let state = self.state.read();
        let mut txs: Vec<Transaction> = state.all.values().map(|e| e.tx.clone()).collect();
        txs.sort_by(|a, b| {
            b.gas_price
                .cmp(&a.gas_price)
                .then(a.nonce.cmp(&b.nonce))
                .then_with(|| a.hash().cmp(&b.hash()))
        });
        txs
    }

    pub fn remove(&self, hashes: &[Hash]) -> usize {
        let mut state = self.state.write();
        hashes.iter().filter(|h| state.all.remove(*h).is_some()).count()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.read().all.contains_key(hash)
    }

    pub fn is_local(&self, address: &Address) -> bool {
        self.state.read().locals.contains(address)
    }

    pub fn len(&self) -> usize {
        self.state.read().all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Minimum gas price for remote admission.
    pub fn gas_price(&self) -> u128 {
        *self.gas_price.read()
    }

    pub fn set_gas_price(&self, price: u128) {
        *self.gas_price.write() = price;
        info!(price, "Transaction pool price threshold updated");
    }

    pub fn chain_config(&self) -> Arc<ChainConfig> {
        self.chain_config.clone()
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        self.rotate_journal()?;
        info!("Transaction pool stopped");
        Ok(())
    }
}
