//! Local accounts and the wallets that hold them.
//!
//! The mining controller falls back to the first account of the first wallet
//! when no etherbase is configured, so wallet order is stable: wallets are kept
//! sorted by URL and accounts in creation order.

use crate::crypto::{address_from_hex, address_to_hex, Address, KeyPair};
use crate::error::NodeError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const KEYFILE_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub address: Address,
    pub url: String,
}

/// A source of accounts.
pub trait Wallet: Send + Sync {
    fn url(&self) -> String;
    fn accounts(&self) -> Vec<Account>;
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    address: String,
    secret: String,
}

/// Wallet backed by secp256k1 keys, optionally persisted one file per key.
pub struct KeystoreWallet {
    url: String,
    dir: Option<PathBuf>,
    keys: RwLock<Vec<KeyPair>>,
}

impl KeystoreWallet {
    pub fn in_memory(name: &str) -> Self {
        Self {
            url: format!("keystore://memory/{}", name),
            dir: None,
            keys: RwLock::new(Vec::new()),
        }
    }

    /// Open the keystore in `dir`, creating it if needed and loading every key
    /// file in name order.
    pub fn open(dir: &Path) -> Result<Self, NodeError> {
        fs::create_dir_all(dir)?;
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == KEYFILE_EXTENSION))
            .collect();
        paths.sort();

        let mut keys = Vec::with_capacity(paths.len());
        for path in paths {
            let file: KeyFile = serde_json::from_str(&fs::read_to_string(&path)?)?;
            let secret = hex::decode(&file.secret)
                .map_err(|e| NodeError::Wallet(format!("{}: bad secret: {}", path.display(), e)))?;
            let pair = KeyPair::from_secret_bytes(&secret)?;
            if pair.address() != address_from_hex(&file.address)? {
                return Err(NodeError::Wallet(format!(
                    "{}: address does not match key",
                    path.display()
                )));
            }
            keys.push(pair);
        }
        debug!(dir = %dir.display(), keys = keys.len(), "Opened keystore");

        Ok(Self {
            url: format!("keystore://{}", dir.display()),
            dir: Some(dir.to_path_buf()),
            keys: RwLock::new(keys),
        })
    }

    pub fn new_account(&self) -> Result<Account, NodeError> {
        self.import_pair(KeyPair::generate())
    }

    pub fn import(&self, secret: &[u8]) -> Result<Account, NodeError> {
        self.import_pair(KeyPair::from_secret_bytes(secret)?)
    }

    fn import_pair(&self, pair: KeyPair) -> Result<Account, NodeError> {
        let address = pair.address();
        let mut keys = self.keys.write();
        if keys.iter().any(|k| k.address() == address) {
            return Err(NodeError::Wallet(format!(
                "account {} already exists",
                address_to_hex(&address)
            )));
        }
        if let Some(dir) = &self.dir {
            let file = KeyFile {
                address: address_to_hex(&address),
                secret: hex::encode(pair.secret_key.secret_bytes()),
            };
            // zero-padded index keeps load order equal to creation order
            let path = dir.join(format!("{:06}-{}.{}", keys.len(), file.address, KEYFILE_EXTENSION));
            fs::write(&path, serde_json::to_vec_pretty(&file)?)?;
            info!(address = %file.address, "Stored new account key");
        }
        keys.push(pair);
        Ok(self.account_for(address))
    }

    fn account_for(&self, address: Address) -> Account {
        Account {
            address,
            url: format!("{}/{}", self.url, address_to_hex(&address)),
        }
    }
}

impl Wallet for KeystoreWallet {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn accounts(&self) -> Vec<Account> {
        self.keys
            .read()
            .iter()
            .map(|k| self.account_for(k.address()))
            .collect()
    }
}

/// Registry of every wallet the node knows about.
#[derive(Default)]
pub struct AccountManager {
    wallets: RwLock<Vec<Arc<dyn Wallet>>>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_wallet(&self, wallet: Arc<dyn Wallet>) {
        let mut wallets = self.wallets.write();
        wallets.push(wallet);
        wallets.sort_by_key(|w| w.url());
    }

    /// Wallets ordered by URL.
    pub fn wallets(&self) -> Vec<Arc<dyn Wallet>> {
        self.wallets.read().clone()
    }

    pub fn find(&self, address: &Address) -> Option<Account> {
        self.wallets
            .read()
            .iter()
            .flat_map(|w| w.accounts())
            .find(|a| &a.address == address)
    }

    /// First account of the first wallet. An empty first wallet yields none,
    /// even when later wallets hold accounts.
    pub fn first_account(&self) -> Option<Account> {
        self.wallets
            .read()
            .first()
            .and_then(|w| w.accounts().into_iter().next())
    }
}
