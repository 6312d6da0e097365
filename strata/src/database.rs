//! The engine façade. Mutations follow lock, then log, then mutate.

use std::fs;
use std::sync::Arc;

use log::{info, warn};

use crate::btree::TreeOptions;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{Result, StrataError};
use crate::failpoint;
use crate::lock_manager::{LockMode, Resource};
use crate::recovery::{RecoveryManager, RecoverySummary, BTREE_INDEX};
use crate::transaction::TransactionManager;
use crate::wal::Action;
use crate::{Key, TxnId, Value};

pub struct Database {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    txns: Arc<TransactionManager>,
    recovery: RecoveryManager,
}

impl Database {
    /// Opens the database in `config.data_dir` and recovers it. Fails rather
    /// than exposing a partially recovered database.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with_options(config, TreeOptions::default())
    }

    pub fn open_with_options(config: EngineConfig, options: TreeOptions) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        fs::create_dir_all(config.checkpoint_dir())?;

        let catalog = Arc::new(Catalog::new(
            config.data_dir.clone(),
            config.buffer_pool_pages,
            options,
        ));
        let txns = Arc::new(TransactionManager::default());
        let recovery = RecoveryManager::open(&config, Arc::clone(&catalog), Arc::clone(&txns))?;
        let db = Self {
            config,
            catalog,
            txns,
            recovery,
        };
        db.recover()?;
        info!("database open at {:?}", db.config.data_dir);
        Ok(db)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs crash recovery. Safe to repeat: each run starts over from the
    /// last complete snapshot.
    pub fn recover(&self) -> Result<RecoverySummary> {
        self.recovery.recover()
    }

    pub fn create_table(&self, kind: &str, name: &str) -> Result<()> {
        // Hash tables are part of the command surface but not stored by this engine.
        if kind != BTREE_INDEX {
            return Err(StrataError::Unsupported(format!("{kind} tables")));
        }
        self.recovery.record_table_creation(kind, name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.catalog.names()
    }

    pub fn begin(&self) -> Result<TxnId> {
        let txn = self.txns.next_txn_id();
        self.recovery.begin(txn)?;
        self.txns.begin(txn);
        Ok(txn)
    }

    pub fn is_active(&self, txn: TxnId) -> bool {
        self.txns.is_active(txn)
    }

    /// Takes an exclusive lock on `table/key` for `txn`. A deadlock rolls
    /// the transaction back before the error is returned.
    pub fn lock(&self, txn: TxnId, table: &str, key: Key) -> Result<()> {
        self.catalog.get(table)?;
        self.acquire(txn, table, key, LockMode::Exclusive)
    }

    fn acquire(&self, txn: TxnId, table: &str, key: Key, mode: LockMode) -> Result<()> {
        match self.txns.lock(txn, &Resource::new(table, key), mode) {
            Err(StrataError::DeadlockDetected { txn }) => {
                warn!("txn {} chosen as deadlock victim on {}/{}", txn, table, key);
                if let Err(e) = self.recovery.rollback(txn) {
                    warn!("rollback of deadlock victim {} failed: {}", txn, e);
                    return Err(e);
                }
                Err(StrataError::DeadlockDetected { txn })
            }
            other => other,
        }
    }

    pub fn insert(&self, txn: TxnId, table: &str, key: Key, value: Value) -> Result<()> {
        let tree = self.catalog.get(table)?;
        self.acquire(txn, table, key, LockMode::Exclusive)?;
        if tree.find(key)?.is_some() {
            return Err(StrataError::DuplicateKey(key));
        }
        let guard = self
            .recovery
            .edit(txn, table, Action::Insert, key, None, Some(value))?;
        failpoint::check(failpoint::AFTER_EDIT_LOGGED)?;
        if let Err(e) = tree.insert(key, value) {
            guard.abandon()?;
            return Err(e);
        }
        Ok(())
    }

    /// Returns the previous value.
    pub fn update(&self, txn: TxnId, table: &str, key: Key, value: Value) -> Result<Value> {
        let tree = self.catalog.get(table)?;
        self.acquire(txn, table, key, LockMode::Exclusive)?;
        let old = tree.find(key)?.ok_or(StrataError::KeyNotFound(key))?;
        let guard = self
            .recovery
            .edit(txn, table, Action::Update, key, Some(old), Some(value))?;
        failpoint::check(failpoint::AFTER_EDIT_LOGGED)?;
        if let Err(e) = tree.update(key, value) {
            guard.abandon()?;
            return Err(e);
        }
        Ok(old)
    }

    /// Deletes `key` if present and returns whether it was. Deleting an
    /// absent key logs nothing.
    pub fn delete(&self, txn: TxnId, table: &str, key: Key) -> Result<bool> {
        let tree = self.catalog.get(table)?;
        self.acquire(txn, table, key, LockMode::Exclusive)?;
        let Some(old) = tree.find(key)? else {
            return Ok(false);
        };
        let guard = self
            .recovery
            .edit(txn, table, Action::Delete, key, Some(old), None)?;
        failpoint::check(failpoint::AFTER_EDIT_LOGGED)?;
        if let Err(e) = tree.delete(key) {
            guard.abandon()?;
            return Err(e);
        }
        Ok(true)
    }

    pub fn commit(&self, txn: TxnId) -> Result<()> {
        self.recovery.commit(txn)?;
        self.txns.commit(txn)
    }

    /// Undoes the transaction's edits and releases its locks.
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        self.recovery.rollback(txn)
    }

    /// Point lookup outside any transaction; takes no resource lock.
    pub fn find(&self, table: &str, key: Key) -> Result<Option<Value>> {
        self.catalog.get(table)?.find(key)
    }

    /// Point lookup under a shared lock held by `txn` until it ends.
    pub fn find_locked(&self, txn: TxnId, table: &str, key: Key) -> Result<Option<Value>> {
        let tree = self.catalog.get(table)?;
        self.acquire(txn, table, key, LockMode::Shared)?;
        tree.find(key)
    }

    pub fn scan(&self, table: &str) -> Result<Vec<(Key, Value)>> {
        self.catalog.get(table)?.scan_all()
    }

    /// Entries with `lo <= key <= hi`.
    pub fn scan_range(&self, table: &str, lo: Key, hi: Key) -> Result<Vec<(Key, Value)>> {
        self.catalog.get(table)?.scan_range(lo, hi)
    }

    pub fn pretty(&self, table: &str) -> Result<String> {
        self.catalog.get(table)?.pretty()
    }

    /// Structural check of one table; returns its entry count.
    pub fn check_table(&self, table: &str) -> Result<usize> {
        self.catalog.get(table)?.check_invariants()
    }

    pub fn checkpoint(&self) -> Result<u64> {
        self.recovery.checkpoint()
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    /// Flushes every table and closes the database.
    pub fn close(self) -> Result<()> {
        self.catalog.flush_all()?;
        info!("database closed");
        Ok(())
    }

    /// Drops the database without flushing anything, as a process crash would.
    pub fn crash(self) {
        warn!("simulated crash of database at {:?}", self.config.data_dir);
    }
}
