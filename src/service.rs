//! Contract between the node host and the services it runs.

use crate::accounts::AccountManager;
use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::persistence::{KeyValueStore, MemoryStore, SqliteStore, CHAINDATA_METRICS_PREFIX};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Resources the host hands to a service while it is being constructed.
#[derive(Clone)]
pub struct ServiceContext {
    data_dir: Option<PathBuf>,
    account_manager: Arc<AccountManager>,
}

impl ServiceContext {
    pub fn new(data_dir: impl Into<PathBuf>, account_manager: Arc<AccountManager>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            account_manager,
        }
    }

    /// A context with no data directory; databases live in memory.
    pub fn ephemeral(account_manager: Arc<AccountManager>) -> Self {
        Self {
            data_dir: None,
            account_manager,
        }
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    pub fn account_manager(&self) -> Arc<AccountManager> {
        self.account_manager.clone()
    }

    /// Resolve `path` against the data directory. Absolute paths pass
    /// through; relative ones need a data directory.
    pub fn resolve_path(&self, path: &Path) -> Option<PathBuf> {
        if path.is_absolute() {
            return Some(path.to_path_buf());
        }
        self.data_dir.as_ref().map(|dir| dir.join(path))
    }

    pub fn open_database(
        &self,
        name: &str,
        cache_mib: usize,
        handles: usize,
    ) -> Result<Arc<dyn KeyValueStore>, NodeError> {
        match &self.data_dir {
            Some(dir) => {
                let path = dir.join(name);
                debug!(path = %path.display(), "Opening database");
                Ok(Arc::new(SqliteStore::open_or_create(&path, cache_mib, handles)?))
            }
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }
}

/// A network protocol a service would register with the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub name: String,
    pub version: u32,
}

/// An RPC namespace a service would expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Api {
    pub namespace: String,
    pub version: String,
    pub public: bool,
}

/// Host state visible to a starting service.
#[derive(Debug, Clone, Default)]
pub struct ServerContext {
    pub name: String,
}

pub trait Service {
    fn protocols(&self) -> Vec<Protocol>;
    fn apis(&self) -> Vec<Api>;
    fn start(&self, server: &ServerContext) -> Result<(), NodeError>;
    fn stop(&self) -> Result<(), NodeError>;
}

/// Open the named chain database and attach its metrics.
pub fn create_db(
    ctx: &ServiceContext,
    config: &NodeConfig,
    name: &str,
) -> Result<Arc<dyn KeyValueStore>, NodeError> {
    let db = ctx.open_database(name, config.database_cache, config.database_handles)?;
    if db.meter(CHAINDATA_METRICS_PREFIX) {
        info!(prefix = CHAINDATA_METRICS_PREFIX, "Database metrics enabled");
    }
    Ok(db)
}
