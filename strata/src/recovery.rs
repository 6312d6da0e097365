//! Write-ahead logging, checkpoints, rollback and crash recovery.
//!
//! Every record is durable before the call that appends it returns. Edits
//! are logged before the index is touched, and the caller keeps an
//! [`EditGuard`] until the mutation is applied, so a checkpoint never sees an
//! edit in the log that is missing from the pages it flushes.
//!
//! Rollback and recovery undo write compensation records, the redo-only
//! inverse of the transaction's newest outstanding edit, and finish with an
//! abort record. A crash in the middle of an undo therefore resumes where it
//! stopped instead of undoing the undo.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::catalog::{validate_table_name, Catalog};
use crate::config::EngineConfig;
use crate::error::{Result, StrataError};
use crate::failpoint;
use crate::index;
use crate::lock_manager::{LockMode, Resource};
use crate::transaction::TransactionManager;
use crate::wal::{self, Action, Edit, LogEntry, LogRecord, LogWriter, Lsn};
use crate::{Key, TxnId, Value};

/// The only index kind the engine stores.
pub const BTREE_INDEX: &str = "btree";

const COMPLETE_MARKER: &str = "COMPLETE";

#[derive(Debug, Default)]
struct RecoveryState {
    /// Outstanding edits of every transaction without a commit or abort record.
    active: BTreeMap<TxnId, Vec<Edit>>,
    next_checkpoint: u64,
}

/// What a recovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub checkpoint: Option<u64>,
    pub records: usize,
    pub redone: usize,
    pub rolled_back: Vec<TxnId>,
    pub truncated_tail: bool,
}

pub struct RecoveryManager {
    log: Mutex<LogWriter>,
    /// Shared by appends and their mutations, exclusive for checkpoint and recovery.
    gate: RwLock<()>,
    state: Mutex<RecoveryState>,
    checkpoint_dir: PathBuf,
    catalog: Arc<Catalog>,
    txns: Arc<TransactionManager>,
}

/// Keeps checkpoints out until the logged edit has been applied.
#[must_use = "hold the guard until the logged mutation is applied"]
pub struct EditGuard<'a> {
    manager: &'a RecoveryManager,
    edit: Edit,
    _gate: RwLockReadGuard<'a, ()>,
}

impl EditGuard<'_> {
    pub fn edit(&self) -> &Edit {
        &self.edit
    }

    /// Logs a compensation for an edit whose mutation failed, leaving the
    /// transaction as if the edit had never been made.
    pub fn abandon(self) -> Result<()> {
        self.manager
            .append(&LogRecord::Compensate(self.edit.inverse()))?;
        if let Some(edits) = self.manager.state.lock().active.get_mut(&self.edit.txn) {
            edits.pop();
        }
        warn!(
            "txn {} abandoned {:?} of {}/{}",
            self.edit.txn, self.edit.action, self.edit.table, self.edit.key
        );
        Ok(())
    }
}

impl RecoveryManager {
    pub fn open(
        config: &EngineConfig,
        catalog: Arc<Catalog>,
        txns: Arc<TransactionManager>,
    ) -> Result<Self> {
        let log = LogWriter::open(config.log_path())?;
        Ok(Self {
            log: Mutex::new(log),
            gate: RwLock::new(()),
            state: Mutex::new(RecoveryState {
                active: BTreeMap::new(),
                next_checkpoint: 1,
            }),
            checkpoint_dir: config.checkpoint_dir(),
            catalog,
            txns,
        })
    }

    fn append(&self, record: &LogRecord) -> Result<Lsn> {
        self.log.lock().append(record)
    }

    fn snapshot_dir(&self, id: u64) -> PathBuf {
        self.checkpoint_dir.join(id.to_string())
    }

    fn snapshot_complete(&self, id: u64) -> bool {
        self.snapshot_dir(id).join(COMPLETE_MARKER).is_file()
    }

    fn is_active(&self, txn: TxnId) -> bool {
        self.state.lock().active.contains_key(&txn)
    }

    /// Transactions with a begin record and no commit or abort record.
    pub fn active_transactions(&self) -> Vec<TxnId> {
        self.state.lock().active.keys().copied().collect()
    }

    /// Logs a table creation and creates the table.
    pub fn record_table_creation(&self, kind: &str, name: &str) -> Result<()> {
        let _gate = self.gate.read();
        if kind != BTREE_INDEX {
            return Err(StrataError::Unsupported(format!("{kind} index")));
        }
        validate_table_name(name)?;
        if self.catalog.contains(name) {
            return Err(StrataError::TableAlreadyExists(name.to_string()));
        }
        self.append(&LogRecord::CreateTable {
            index: kind.to_string(),
            name: name.to_string(),
        })?;
        self.catalog.create(name)?;
        Ok(())
    }

    pub fn begin(&self, txn: TxnId) -> Result<()> {
        let _gate = self.gate.read();
        self.append(&LogRecord::Begin { txn })?;
        self.state.lock().active.entry(txn).or_default();
        Ok(())
    }

    /// Logs an edit ahead of its mutation. The mutation must be applied
    /// before the returned guard is dropped.
    pub fn edit(
        &self,
        txn: TxnId,
        table: &str,
        action: Action,
        key: Key,
        old: Option<Value>,
        new: Option<Value>,
    ) -> Result<EditGuard<'_>> {
        let gate = self.gate.read();
        if !self.is_active(txn) {
            return Err(StrataError::UnknownTransaction(txn));
        }
        let edit = Edit {
            txn,
            table: table.to_string(),
            action,
            key,
            old,
            new,
        };
        self.append(&LogRecord::Edit(edit.clone()))?;
        self.txns.record_write(txn, &edit.resource());
        if let Some(edits) = self.state.lock().active.get_mut(&txn) {
            edits.push(edit.clone());
        }
        Ok(EditGuard {
            manager: self,
            edit,
            _gate: gate,
        })
    }

    pub fn commit(&self, txn: TxnId) -> Result<()> {
        let _gate = self.gate.read();
        if !self.is_active(txn) {
            return Err(StrataError::UnknownTransaction(txn));
        }
        self.append(&LogRecord::Commit { txn })?;
        self.state.lock().active.remove(&txn);
        Ok(())
    }

    /// Flushes every table, logs the active set and snapshots the table files.
    /// Returns the checkpoint id.
    pub fn checkpoint(&self) -> Result<u64> {
        let _gate = self.gate.write();
        self.catalog.flush_all()?;

        let (id, active) = {
            let mut state = self.state.lock();
            let id = state.next_checkpoint;
            state.next_checkpoint += 1;
            (id, state.active.keys().copied().collect::<Vec<_>>())
        };
        self.append(&LogRecord::Checkpoint {
            id,
            active: active.clone(),
        })?;
        failpoint::check(failpoint::BEFORE_SNAPSHOT)?;

        let dir = self.snapshot_dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        self.catalog.snapshot(&dir)?;
        fs::File::create(dir.join(COMPLETE_MARKER))?.sync_all()?;
        self.prune_snapshots(id)?;

        info!("checkpoint {} complete, active transactions {:?}", id, active);
        Ok(id)
    }

    fn prune_snapshots(&self, keep: u64) -> Result<()> {
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            let older = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<u64>().ok())
                .is_some_and(|id| id < keep);
            if older {
                fs::remove_dir_all(&path)?;
                debug!("pruned snapshot {:?}", path);
            }
        }
        Ok(())
    }

    fn apply(&self, edit: &Edit) -> Result<()> {
        let tree = self.catalog.get(&edit.table)?;
        index::reapply(tree.as_ref(), edit.action, edit.key, edit.new)
    }

    /// Undoes every outstanding edit of `txn`, newest first, then releases its locks.
    pub fn rollback(&self, txn: TxnId) -> Result<()> {
        let mut needed: Vec<Resource> = self
            .state
            .lock()
            .active
            .get(&txn)
            .ok_or(StrataError::UnknownTransaction(txn))?
            .iter()
            .map(Edit::resource)
            .collect();
        needed.sort();
        needed.dedup();
        self.acquire_for_undo(txn, &needed)?;

        let mut undone = 0;
        loop {
            let newest = self
                .state
                .lock()
                .active
                .get(&txn)
                .and_then(|edits| edits.last().cloned());
            let Some(edit) = newest else { break };
            {
                let _gate = self.gate.read();
                let compensation = edit.inverse();
                self.append(&LogRecord::Compensate(compensation.clone()))?;
                self.apply(&compensation)?;
                if let Some(edits) = self.state.lock().active.get_mut(&txn) {
                    edits.pop();
                }
            }
            undone += 1;
            failpoint::check(failpoint::DURING_ROLLBACK)?;
        }

        {
            let _gate = self.gate.read();
            self.append(&LogRecord::Abort { txn })?;
            self.state.lock().active.remove(&txn);
        }
        self.txns.rollback(txn)?;
        info!("txn {} rolled back, {} edits undone", txn, undone);
        Ok(())
    }

    /// Locks already held are kept; missing ones are taken in sorted order.
    /// Edited resources cannot be unlocked early, so a live transaction
    /// already holds every one of them and nothing here waits.
    fn acquire_for_undo(&self, txn: TxnId, needed: &[Resource]) -> Result<()> {
        if !self.txns.is_active(txn) {
            self.txns.begin(txn);
        }
        needed
            .iter()
            .try_for_each(|resource| self.txns.lock(txn, resource, LockMode::Exclusive))
    }

    /// Rebuilds the tables from the last complete snapshot and the log, then
    /// rolls back every transaction that never finished.
    pub fn recover(&self) -> Result<RecoverySummary> {
        let _gate = self.gate.write();
        let log_path = self.log.lock().path().to_path_buf();
        let contents = wal::read_log(&log_path)?;
        if contents.torn_tail {
            self.log.lock().truncate(contents.valid_len)?;
        }
        let entries = contents.entries;

        let checkpoint = entries.iter().enumerate().rev().find_map(|(pos, entry)| match &entry.record {
            LogRecord::Checkpoint { id, .. } if self.snapshot_complete(*id) => Some((pos, *id)),
            _ => None,
        });
        // Analysis runs before any table file is touched, so an inconsistent
        // log leaves the data directory as it was.
        let Analysis {
            tables,
            active,
            max_txn,
            max_checkpoint,
        } = analyse(&entries, checkpoint.map(|(pos, _)| pos))?;

        let snapshot = checkpoint.map(|(_, id)| self.snapshot_dir(id));
        self.catalog.restore(snapshot.as_deref())?;
        for name in &tables {
            self.catalog.open_or_create(name)?;
        }

        // Redo.
        let redo_from = checkpoint.map_or(0, |(pos, _)| pos + 1);
        let mut redone = 0;
        for entry in &entries[redo_from..] {
            if let LogRecord::Edit(edit) | LogRecord::Compensate(edit) = &entry.record {
                self.apply(edit)?;
                redone += 1;
            }
        }

        // Undo, newest transaction first.
        let mut rolled_back = Vec::new();
        for (txn, mut edits) in active.into_iter().rev() {
            while let Some(edit) = edits.pop() {
                let compensation = edit.inverse();
                self.append(&LogRecord::Compensate(compensation.clone()))?;
                self.apply(&compensation)?;
            }
            self.append(&LogRecord::Abort { txn })?;
            if self.txns.is_active(txn) {
                self.txns.rollback(txn)?;
            }
            rolled_back.push(txn);
        }

        {
            let mut state = self.state.lock();
            state.active.clear();
            state.next_checkpoint = max_checkpoint + 1;
        }
        self.txns.advance_txn_id(max_txn + 1);

        let summary = RecoverySummary {
            checkpoint: checkpoint.map(|(_, id)| id),
            records: entries.len(),
            redone,
            rolled_back,
            truncated_tail: contents.torn_tail,
        };
        info!("recovery finished: {:?}", summary);
        Ok(summary)
    }
}

/// What analysis learns from the log.
#[derive(Debug, Default)]
struct Analysis {
    /// Tables in creation order.
    tables: Vec<String>,
    /// Outstanding edits of every transaction that never finished.
    active: BTreeMap<TxnId, Vec<Edit>>,
    max_txn: TxnId,
    max_checkpoint: u64,
}

/// Replays the whole log without side effects. `chosen` is the position of
/// the checkpoint recovery restores from; its active set must match.
fn analyse(entries: &[LogEntry], chosen: Option<usize>) -> Result<Analysis> {
    let mut analysis = Analysis::default();
    let mut known: HashSet<&str> = HashSet::new();
    for (pos, entry) in entries.iter().enumerate() {
        let inconsistent = |what: String| {
            StrataError::RecoveryInconsistency(format!("record at {}: {what}", entry.lsn))
        };
        let active = &mut analysis.active;
        match &entry.record {
            LogRecord::CreateTable { index, name } => {
                if index != BTREE_INDEX {
                    return Err(inconsistent(format!("unsupported index kind {index}")));
                }
                validate_table_name(name)?;
                if known.insert(name.as_str()) {
                    analysis.tables.push(name.clone());
                }
            }
            LogRecord::Begin { txn } => {
                analysis.max_txn = analysis.max_txn.max(*txn);
                if active.insert(*txn, Vec::new()).is_some() {
                    return Err(inconsistent(format!("txn {txn} begun twice")));
                }
            }
            LogRecord::Edit(edit) => {
                if !known.contains(edit.table.as_str()) {
                    return Err(inconsistent(format!("edit of unknown table {}", edit.table)));
                }
                active
                    .get_mut(&edit.txn)
                    .ok_or_else(|| inconsistent(format!("edit by unknown txn {}", edit.txn)))?
                    .push(edit.clone());
            }
            LogRecord::Compensate(compensation) => {
                let undone = active
                    .get_mut(&compensation.txn)
                    .and_then(Vec::pop)
                    .ok_or_else(|| {
                        inconsistent(format!(
                            "compensation by txn {} with nothing to undo",
                            compensation.txn
                        ))
                    })?;
                if undone.inverse() != *compensation {
                    return Err(inconsistent(format!(
                        "compensation {compensation:?} does not undo {undone:?}"
                    )));
                }
            }
            LogRecord::Commit { txn } | LogRecord::Abort { txn } => {
                if active.remove(txn).is_none() {
                    return Err(inconsistent(format!("end of unknown txn {txn}")));
                }
            }
            LogRecord::Checkpoint { id, active: recorded } => {
                analysis.max_checkpoint = analysis.max_checkpoint.max(*id);
                if chosen == Some(pos) {
                    let analysed: Vec<TxnId> = active.keys().copied().collect();
                    let mut recorded = recorded.clone();
                    recorded.sort_unstable();
                    if analysed != recorded {
                        return Err(inconsistent(format!(
                            "checkpoint {id} lists {recorded:?}, log shows {analysed:?}"
                        )));
                    }
                }
            }
        }
    }
    Ok(analysis)
}
