use crate::accounts::AccountManager;
use crate::blockchain::{Ledger, VmConfig};
use crate::config::NodeConfig;
use crate::consensus::{create_consensus_engine, ConsensusEngine};
use crate::crypto::{address_to_hex, is_zero_address, Address, Hash};
use crate::error::NodeError;
use crate::event::EventMux;
use crate::genesis::{self, GenesisReconciliation};
use crate::miner::{make_extra_data, Miner};
use crate::params::{ChainConfig, BLOCKCHAIN_VERSION};
use crate::persistence::KeyValueStore;
use crate::rawdb;
use crate::service::{create_db, Api, Protocol, ServerContext, Service, ServiceContext};
use crate::txpool::{TxPool, TxPoolConfig};
use crate::version;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the chain database inside the data directory.
pub const CHAINDATA_NAME: &str = "chaindata";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MiningState {
    etherbase: Address,
    gas_price: u128,
}

/// Runtime-adjustable mining parameters shared between the control surface
/// and the miner.
pub struct MiningParams {
    inner: RwLock<MiningState>,
}

impl MiningParams {
    pub fn new(etherbase: Address, gas_price: u128) -> Self {
        Self {
            inner: RwLock::new(MiningState { etherbase, gas_price }),
        }
    }

    pub fn etherbase(&self) -> Address {
        self.inner.read().etherbase
    }

    pub fn set_etherbase(&self, etherbase: Address) {
        self.inner.write().etherbase = etherbase;
    }

    pub fn gas_price(&self) -> u128 {
        self.inner.read().gas_price
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        self.inner.write().gas_price = gas_price;
    }
}

/// Build the ledger and the transaction pool over a reconciled store.
///
/// A pending compatibility warning is resolved here, before any block can be
/// accepted: the ledger is rewound and the upgraded configuration persisted
/// and adopted.
pub fn wire_ledger_and_pool(
    ctx: &ServiceContext,
    store: Arc<dyn KeyValueStore>,
    reconciliation: &GenesisReconciliation,
    engine: Arc<dyn ConsensusEngine>,
    vm_config: VmConfig,
    pool_config: TxPoolConfig,
    events: &EventMux,
) -> Result<(Arc<ChainConfig>, Arc<RwLock<Ledger>>, Arc<TxPool>), NodeError> {
    let mut ledger = Ledger::new(
        store.clone(),
        Arc::new(reconciliation.chain_config.clone()),
        engine,
        vm_config,
    )?
    .with_events(events.clone());

    if let Some(compat) = &reconciliation.compat {
        warn!(error = %compat.error, "Rewinding chain to upgrade configuration");
        ledger.set_head(compat.rewind_to())?;
        rawdb::write_chain_config(&*store, &reconciliation.genesis_hash, &compat.upgraded)?;
        ledger.set_chain_config(Arc::new(compat.upgraded.clone()));
    }
    let chain_config = ledger.chain_config();

    let mut pool_config = pool_config;
    if let Some(journal) = pool_config.journal.take() {
        pool_config.journal = ctx.resolve_path(&journal);
        if pool_config.journal.is_none() {
            debug!("No data directory, transaction journal disabled");
        }
    }

    let ledger = Arc::new(RwLock::new(ledger));
    let pool = Arc::new(TxPool::new(pool_config, chain_config.clone(), ledger.clone())?);
    Ok((chain_config, ledger, pool))
}

/// The full-node service: owns the chain database and everything built on
/// top of it, and controls block production.
pub struct NodeService {
    config: NodeConfig,
    chain_db: Arc<dyn KeyValueStore>,
    chain_config: Arc<ChainConfig>,
    genesis_hash: Hash,
    engine: Arc<dyn ConsensusEngine>,
    ledger: Arc<RwLock<Ledger>>,
    tx_pool: Arc<TxPool>,
    miner: Miner,
    event_mux: EventMux,
    account_manager: Arc<AccountManager>,
    mining: MiningParams,
    stopped: AtomicBool,
}

impl NodeService {
    /// Open the chain database and bring every subsystem up. On failure the
    /// database is closed again and nothing escapes.
    pub fn new(ctx: &ServiceContext, config: NodeConfig) -> Result<Self, NodeError> {
        let chain_db = create_db(ctx, &config, CHAINDATA_NAME)?;
        match Self::assemble(ctx, config, chain_db.clone()) {
            Ok(node) => Ok(node),
            Err(e) => {
                if let Err(close_err) = chain_db.close() {
                    warn!(error = %close_err, "Failed to close chain database");
                }
                Err(e)
            }
        }
    }

    fn assemble(
        ctx: &ServiceContext,
        config: NodeConfig,
        chain_db: Arc<dyn KeyValueStore>,
    ) -> Result<Self, NodeError> {
        info!(database_version = BLOCKCHAIN_VERSION, "Initialising node service");
        version::check_and_stamp(&*chain_db, BLOCKCHAIN_VERSION, config.skip_bc_version_check)?;

        let reconciliation = genesis::reconcile(&*chain_db, config.genesis.as_ref())?;
        info!(
            genesis = %hex::encode(reconciliation.genesis_hash),
            config = ?reconciliation.chain_config,
            "Initialised chain configuration"
        );

        let engine = create_consensus_engine(&config, &reconciliation.chain_config, chain_db.clone())?;
        let event_mux = EventMux::new();
        let vm_config = VmConfig {
            enable_preimage_recording: config.enable_preimage_recording,
        };
        let (chain_config, ledger, tx_pool) = wire_ledger_and_pool(
            ctx,
            chain_db.clone(),
            &reconciliation,
            engine.clone(),
            vm_config,
            config.tx_pool.clone(),
            &event_mux,
        )?;

        let miner = Miner::new(
            ledger.clone(),
            tx_pool.clone(),
            engine.clone(),
            event_mux.clone(),
            config.miner_recommit,
        );
        miner.set_extra(make_extra_data(config.extra_data.as_bytes()));

        let mining = MiningParams::new(config.etherbase_address()?, config.gas_price);

        Ok(Self {
            config,
            chain_db,
            chain_config,
            genesis_hash: reconciliation.genesis_hash,
            engine,
            ledger,
            tx_pool,
            miner,
            event_mux,
            account_manager: ctx.account_manager(),
            mining,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn account_manager(&self) -> Arc<AccountManager> {
        self.account_manager.clone()
    }

    pub fn ledger(&self) -> Arc<RwLock<Ledger>> {
        self.ledger.clone()
    }

    pub fn tx_pool(&self) -> Arc<TxPool> {
        self.tx_pool.clone()
    }

    pub fn chain_db(&self) -> Arc<dyn KeyValueStore> {
        self.chain_db.clone()
    }

    pub fn event_mux(&self) -> EventMux {
        self.event_mux.clone()
    }

    pub fn engine(&self) -> Arc<dyn ConsensusEngine> {
        self.engine.clone()
    }

    pub fn chain_config(&self) -> Arc<ChainConfig> {
        self.chain_config.clone()
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    pub fn miner(&self) -> &Miner {
        &self.miner
    }

    /// Address credited for mined blocks: the configured one, else the first
    /// account of the first wallet. The fallback is resolved on every call and
    /// never stored.
    pub fn etherbase(&self) -> Result<Address, NodeError> {
        let configured = self.mining.etherbase();
        if !is_zero_address(&configured) {
            return Ok(configured);
        }
        if let Some(account) = self.account_manager.first_account() {
            debug!(address = %address_to_hex(&account.address), "Etherbase resolved from wallet");
            return Ok(account.address);
        }
        Err(NodeError::NoEtherbase)
    }

    pub fn set_etherbase(&self, etherbase: Address) {
        self.mining.set_etherbase(etherbase);
        self.miner.set_coinbase(etherbase);
    }

    pub fn gas_price(&self) -> u128 {
        self.mining.gas_price()
    }

    pub fn set_gas_price(&self, gas_price: u128) {
        self.mining.set_gas_price(gas_price);
    }

    /// Start block production in the background. Calling it again while the
    /// miner runs only refreshes the coinbase and the pool price threshold.
    pub fn start_mining(&self, local: bool) -> Result<(), NodeError> {
        let etherbase = self.etherbase().map_err(|e| {
            error!(error = %e, "Cannot start mining without etherbase");
            NodeError::EtherbaseMissing(Box::new(e))
        })?;

        self.tx_pool.set_gas_price(self.mining.gas_price());
        self.miner.start(etherbase, local)?;
        Ok(())
    }

    pub fn stop_mining(&self) {
        self.miner.stop();
    }

    pub fn is_mining(&self) -> bool {
        self.miner.is_mining()
    }

    /// Stop the miner and wait for it before tearing everything else down.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.miner.stop();
        self.miner.join().await;
        self.stop()
    }
}

impl Service for NodeService {
    fn protocols(&self) -> Vec<Protocol> {
        Vec::new()
    }

    fn apis(&self) -> Vec<Api> {
        Vec::new()
    }

    fn start(&self, server: &ServerContext) -> Result<(), NodeError> {
        info!(server = %server.name, head = self.ledger.read().height(), "Node service started");
        Ok(())
    }

    fn stop(&self) -> Result<(), NodeError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.miner.stop();
        let pool_result = self.tx_pool.stop();
        if let Err(e) = &pool_result {
            warn!(error = %e, "Failed to rotate transaction journal");
        }
        if let Err(e) = self.chain_db.flush() {
            warn!(error = %e, "Failed to flush chain database");
        }
        self.chain_db.close()?;
        info!("Node service stopped");
        pool_result
    }
}
