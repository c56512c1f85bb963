//! Database persistence layer for ledgerd
//!
//! The node keeps all of its chain data in a flat key-value store. The
//! production backend is a single SQLite table; [`MemoryStore`] backs ephemeral
//! nodes and tests.

use crate::error::NodeError;
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Smallest cache allowance (MiB) handed to the backend.
pub const MIN_CACHE_MIB: usize = 16;
/// Smallest number of cached statement handles.
pub const MIN_HANDLES: usize = 16;

/// Namespace under which the chain database reports its metrics.
pub const CHAINDATA_METRICS_PREFIX: &str = "ledgerd/db/chaindata/";

const CURRENT_FORMAT_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of writes applied atomically by [`KeyValueStore::write_batch`].
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Abstraction over the node's key-value database.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, NodeError>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), NodeError>;
    fn delete(&self, key: &[u8]) -> Result<(), NodeError>;

    fn has(&self, key: &[u8]) -> Result<bool, NodeError> {
        Ok(self.get(key)?.is_some())
    }

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, NodeError>;

    fn write_batch(&self, batch: WriteBatch) -> Result<(), NodeError>;

    /// Start collecting metrics under `prefix`. Returns false when the backend
    /// does not support metering.
    fn meter(&self, _prefix: &str) -> bool {
        false
    }

    fn metrics(&self) -> Option<DbMetricsSnapshot> {
        None
    }

    /// Write dirty pages back to the backing file.
    fn flush(&self) -> Result<(), NodeError> {
        Ok(())
    }

    /// Release the backend. Further operations fail.
    fn close(&self) -> Result<(), NodeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbMetricsSnapshot {
    pub prefix: String,
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[derive(Debug)]
struct DbMetrics {
    prefix: String,
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl DbMetrics {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    fn record_read(&self, bytes: usize) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_write(&self, bytes: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DbMetricsSnapshot {
        DbMetricsSnapshot {
            prefix: self.prefix.clone(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of the format upgrade run when a store is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub migrated: usize,
}

/// SQLite-backed store holding every record in one `kv` table.
pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
    metrics: once_cell::sync::OnceCell<DbMetrics>,
    upgrade: UpgradeReport,
}

impl SqliteStore {
    /// Open the store at `path`, creating it if absent, and apply any pending
    /// format upgrade. `":memory:"` opens a private in-memory database.
    pub fn open_or_create(path: &Path, cache_mib: usize, handles: usize) -> Result<Self, NodeError> {
        let cache_mib = if cache_mib < MIN_CACHE_MIB {
            info!(requested = cache_mib, used = MIN_CACHE_MIB, "Raising database cache allowance");
            MIN_CACHE_MIB
        } else {
            cache_mib
        };
        let handles = if handles < MIN_HANDLES {
            info!(requested = handles, used = MIN_HANDLES, "Raising database handle allowance");
            MIN_HANDLES
        } else {
            handles
        };

        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open(path)
        }
        .map_err(|e| NodeError::Database(format!("Failed to open database {:?}: {}", path, e)))?;

        conn.pragma_update(None, "cache_size", -((cache_mib * 1024) as i64))
            .map_err(|e| NodeError::Database(format!("Failed to set cache size: {}", e)))?;
        conn.set_prepared_statement_cache_capacity(handles);
        conn.busy_timeout(std::time::Duration::ZERO)
            .map_err(|e| NodeError::Database(format!("Failed to set busy timeout: {}", e)))?;

        // Hold the file for the lifetime of the connection so a second node
        // pointed at the same directory fails fast.
        let mode: String = conn
            .pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| row.get(0))
            .map_err(|e| NodeError::Database(format!("Failed to set locking mode: {}", e)))?;
        debug!(path = ?path, %mode, "Database locking mode");
        conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")
            .map_err(|e| NodeError::Database(format!("Database {:?} is locked or unreadable: {}", path, e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| NodeError::Database(format!("Failed to create kv table: {}", e)))?;

        let upgrade = upgrade_store(&conn)?;
        if upgrade.migrated > 0 {
            info!(migrated = upgrade.migrated, "Upgraded legacy database records");
        }
        info!(path = ?path, cache_mib, handles, "Allocated chain database");

        Ok(SqliteStore {
            conn: Mutex::new(Some(conn)),
            metrics: once_cell::sync::OnceCell::new(),
            upgrade,
        })
    }

    pub fn upgrade_report(&self) -> UpgradeReport {
        self.upgrade
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, NodeError>) -> Result<T, NodeError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| NodeError::Database("Mutex poisoned".to_string()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| NodeError::Database("Database is closed".to_string()))?;
        f(conn)
    }
}

/// Migrate the legacy text `metadata` table into `kv` and stamp the format
/// version. Entries already present in `kv` are left untouched.
pub fn upgrade_store(conn: &Connection) -> Result<UpgradeReport, NodeError> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| NodeError::Database(format!("Failed to read format version: {}", e)))?;
    if version >= CURRENT_FORMAT_VERSION {
        return Ok(UpgradeReport::default());
    }

    let has_legacy: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'metadata'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| NodeError::Database(format!("Failed to inspect schema: {}", e)))?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| NodeError::Database(format!("Failed to start transaction: {}", e)))?;

    let mut migrated = 0;
    if has_legacy.is_some() {
        let rows: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare("SELECT key, value FROM metadata")
                .map_err(|e| NodeError::Database(format!("Failed to prepare query: {}", e)))?;
            let iter = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| NodeError::Database(format!("Failed to query metadata: {}", e)))?;
            iter.collect::<Result<_, _>>()
                .map_err(|e| NodeError::Database(format!("Failed to read row: {}", e)))?
        };

        for (key, value) in rows {
            migrated += tx
                .execute(
                    "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
                    params![key.into_bytes(), value.into_bytes()],
                )
                .map_err(|e| NodeError::Database(format!("Failed to migrate record: {}", e)))?;
        }

        tx.execute("DROP TABLE metadata", [])
            .map_err(|e| NodeError::Database(format!("Failed to drop legacy table: {}", e)))?;
    }

    tx.pragma_update(None, "user_version", CURRENT_FORMAT_VERSION)
        .map_err(|e| NodeError::Database(format!("Failed to stamp format version: {}", e)))?;
    tx.commit()
        .map_err(|e| NodeError::Database(format!("Failed to commit upgrade: {}", e)))?;

    Ok(UpgradeReport { migrated })
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, NodeError> {
        let value: Option<Vec<u8>> = self.with_conn(|conn| {
            conn.prepare_cached("SELECT value FROM kv WHERE key = ?1")
                .and_then(|mut stmt| stmt.query_row(params![key], |row| row.get(0)).optional())
                .map_err(|e| NodeError::Database(format!("Failed to read key: {}", e)))
        })?;
        if let Some(metrics) = self.metrics.get() {
            metrics.record_read(value.as_ref().map_or(0, Vec::len));
        }
        Ok(value)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), NodeError> {
        self.with_conn(|conn| {
            conn.prepare_cached("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")
                .and_then(|mut stmt| stmt.execute(params![key, value]))
                .map_err(|e| NodeError::Database(format!("Failed to write key: {}", e)))
        })?;
        if let Some(metrics) = self.metrics.get() {
            metrics.record_write(key.len() + value.len());
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), NodeError> {
        self.with_conn(|conn| {
            conn.prepare_cached("DELETE FROM kv WHERE key = ?1")
                .and_then(|mut stmt| stmt.execute(params![key]))
                .map_err(|e| NodeError::Database(format!("Failed to delete key: {}", e)))
        })?;
        if let Some(metrics) = self.metrics.get() {
            metrics.record_write(key.len());
        }
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, NodeError> {
        let entries = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT key, value FROM kv WHERE key >= ?1 ORDER BY key ASC")
                .map_err(|e| NodeError::Database(format!("Failed to prepare query: {}", e)))?;
            let rows = stmt
                .query_map(params![prefix], |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)))
                .map_err(|e| NodeError::Database(format!("Failed to iterate: {}", e)))?;

            let mut entries = Vec::new();
            for row in rows {
                let (key, value) =
                    row.map_err(|e| NodeError::Database(format!("Failed to read row: {}", e)))?;
                if !key.starts_with(prefix) {
                    break;
                }
                entries.push((key, value));
            }
            Ok(entries)
        })?;
        if let Some(metrics) = self.metrics.get() {
            for (_, value) in &entries {
                metrics.record_read(value.len());
            }
        }
        Ok(entries)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), NodeError> {
        self.with_conn(|conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| NodeError::Database(format!("Failed to start transaction: {}", e)))?;
            for op in batch.ops() {
                match op {
                    BatchOp::Put(key, value) => tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    ),
                    BatchOp::Delete(key) => tx.execute("DELETE FROM kv WHERE key = ?1", params![key]),
                }
                .map_err(|e| NodeError::Database(format!("Failed to apply batch: {}", e)))?;
            }
            tx.commit()
                .map_err(|e| NodeError::Database(format!("Failed to commit batch: {}", e)))
        })?;
        if let Some(metrics) = self.metrics.get() {
            for op in batch.ops() {
                match op {
                    BatchOp::Put(key, value) => metrics.record_write(key.len() + value.len()),
                    BatchOp::Delete(key) => metrics.record_write(key.len()),
                }
            }
        }
        Ok(())
    }

    fn meter(&self, prefix: &str) -> bool {
        if self.metrics.set(DbMetrics::new(prefix)).is_err() {
            warn!(prefix, "Database metrics already registered");
        }
        true
    }

    fn metrics(&self) -> Option<DbMetricsSnapshot> {
        self.metrics.get().map(DbMetrics::snapshot)
    }

    fn flush(&self) -> Result<(), NodeError> {
        self.with_conn(|conn| {
            conn.cache_flush()
                .map_err(|e| NodeError::Database(format!("Failed to flush database: {}", e)))
        })
    }

    fn close(&self) -> Result<(), NodeError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| NodeError::Database("Mutex poisoned".to_string()))?;
        if let Some(conn) = guard.take() {
            if let Some(metrics) = self.metrics.get() {
                debug!(stats = ?metrics.snapshot(), "Database metrics at close");
            }
            conn.close()
                .map_err(|(_, e)| NodeError::Database(format!("Failed to close database: {}", e)))?;
            info!("Database closed");
        }
        Ok(())
    }
}

/// In-memory store used for ephemeral nodes and tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<(), NodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Database("Database is closed".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, NodeError> {
        self.ensure_open()?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), NodeError> {
        self.ensure_open()?;
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), NodeError> {
        self.ensure_open()?;
        self.entries.write().remove(key);
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, NodeError> {
        self.ensure_open()?;
        Ok(self
            .entries
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), NodeError> {
        self.ensure_open()?;
        let mut entries = self.entries.write();
        for op in batch.ops {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<(), NodeError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
