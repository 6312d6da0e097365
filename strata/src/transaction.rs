//! Transaction management: strict two-phase locking over the lock manager.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::error::{Result, StrataError};
use crate::lock_manager::{LockManager, LockMode, Resource};
use crate::TxnId;

#[derive(Debug, Default)]
struct Transaction {
    held: HashMap<Resource, LockMode>,
    /// Resources with a logged edit. Their locks stay until the transaction ends.
    written: HashSet<Resource>,
}

/// The transaction manager. Shared across threads behind an `Arc`.
#[derive(Debug)]
pub struct TransactionManager {
    locks: LockManager,
    transactions: Mutex<HashMap<TxnId, Transaction>>,
    next_txn_id: AtomicU64,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TransactionManager {
    pub fn new(initial_txn_id: TxnId) -> Self {
        Self {
            locks: LockManager::new(),
            transactions: Mutex::new(HashMap::new()),
            next_txn_id: AtomicU64::new(initial_txn_id),
        }
    }

    /// Vends a fresh transaction id.
    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Makes sure future ids are at least `floor`.
    pub fn advance_txn_id(&self, floor: TxnId) {
        self.next_txn_id.fetch_max(floor, Ordering::SeqCst);
    }

    /// Registers `txn` as active. Registering an active transaction again is a no-op.
    pub fn begin(&self, txn: TxnId) {
        self.transactions.lock().entry(txn).or_default();
        self.advance_txn_id(txn + 1);
        debug!("txn {} registered", txn);
    }

    pub fn is_active(&self, txn: TxnId) -> bool {
        self.transactions.lock().contains_key(&txn)
    }

    pub fn active_transactions(&self) -> Vec<TxnId> {
        let mut active: Vec<TxnId> = self.transactions.lock().keys().copied().collect();
        active.sort_unstable();
        active
    }

    fn held_mode(&self, txn: TxnId, resource: &Resource) -> Result<Option<LockMode>> {
        let transactions = self.transactions.lock();
        let entry = transactions
            .get(&txn)
            .ok_or(StrataError::UnknownTransaction(txn))?;
        Ok(entry.held.get(resource).copied())
    }

    /// Acquires `resource` in `mode`, blocking while it conflicts with other
    /// holders. An exclusive lock already covers a shared request; upgrading
    /// a shared lock is refused.
    pub fn lock(&self, txn: TxnId, resource: &Resource, mode: LockMode) -> Result<()> {
        match (self.held_mode(txn, resource)?, mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => {
                return Ok(())
            }
            (Some(LockMode::Shared), LockMode::Exclusive) => {
                return Err(StrataError::LockUpgradeForbidden { txn })
            }
            (None, _) => {}
        }

        self.locks.acquire(txn, resource, mode)?;
        match self.transactions.lock().get_mut(&txn) {
            Some(entry) => {
                entry.held.insert(resource.clone(), mode);
                Ok(())
            }
            None => {
                // Ended by another thread while we waited.
                self.locks.release(txn, resource);
                Err(StrataError::UnknownTransaction(txn))
            }
        }
    }

    /// Marks `resource` as edited by `txn`. Unknown transactions are ignored.
    pub fn record_write(&self, txn: TxnId, resource: &Resource) {
        if let Some(entry) = self.transactions.lock().get_mut(&txn) {
            entry.written.insert(resource.clone());
        }
    }

    /// Releases one lock early. Fails if the lock is not held in `mode`, or
    /// if it covers an edit the transaction has not yet committed.
    pub fn unlock(&self, txn: TxnId, resource: &Resource, mode: LockMode) -> Result<()> {
        {
            let mut transactions = self.transactions.lock();
            let entry = transactions
                .get_mut(&txn)
                .ok_or(StrataError::UnknownTransaction(txn))?;
            if entry.written.contains(resource) {
                return Err(StrataError::UncommittedWrite {
                    txn,
                    resource: resource.to_string(),
                });
            }
            match entry.held.get(resource) {
                None => {
                    return Err(StrataError::NotLocked {
                        txn,
                        resource: resource.to_string(),
                    })
                }
                Some(held) if *held != mode => {
                    return Err(StrataError::ModeMismatch {
                        txn,
                        resource: resource.to_string(),
                    })
                }
                Some(_) => {
                    entry.held.remove(resource);
                }
            }
        }
        self.locks.release(txn, resource);
        Ok(())
    }

    pub fn commit(&self, txn: TxnId) -> Result<()> {
        self.finish(txn)?;
        debug!("txn {} committed", txn);
        Ok(())
    }

    /// Releases the locks of `txn` and forgets it. Data undo is the recovery
    /// manager's job.
    pub fn rollback(&self, txn: TxnId) -> Result<()> {
        self.finish(txn)?;
        debug!("txn {} rolled back", txn);
        Ok(())
    }

    fn finish(&self, txn: TxnId) -> Result<()> {
        let entry = self
            .transactions
            .lock()
            .remove(&txn)
            .ok_or(StrataError::UnknownTransaction(txn))?;
        self.locks.release_all(txn, entry.held.keys());
        Ok(())
    }

    /// Locks held by `txn`, sorted by resource.
    pub fn held_locks(&self, txn: TxnId) -> Vec<(Resource, LockMode)> {
        let mut held: Vec<(Resource, LockMode)> = self
            .transactions
            .lock()
            .get(&txn)
            .map(|entry| entry.held.iter().map(|(r, m)| (r.clone(), *m)).collect())
            .unwrap_or_default();
        held.sort_by(|a, b| a.0.cmp(&b.0));
        held
    }

    /// Current `(waiter, holder)` edges.
    pub fn waits_for_snapshot(&self) -> Vec<(TxnId, TxnId)> {
        self.locks.waits_for_edges()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn res(key: i64) -> Resource {
        Resource::new("accounts", key)
    }

    #[test]
    fn test_lock_requires_known_transaction() {
        let tm = TransactionManager::default();
        let err = tm.lock(7, &res(1), LockMode::Shared).unwrap_err();
        assert!(matches!(err, StrataError::UnknownTransaction(7)));
    }

    #[test]
    fn test_exclusive_subsumes_shared() {
        let tm = TransactionManager::default();
        tm.begin(1);
        tm.lock(1, &res(1), LockMode::Exclusive).unwrap();
        tm.lock(1, &res(1), LockMode::Shared).unwrap();
        tm.lock(1, &res(1), LockMode::Exclusive).unwrap();
        assert_eq!(tm.held_locks(1), vec![(res(1), LockMode::Exclusive)]);
    }

    #[test]
    fn test_upgrade_is_forbidden() {
        let tm = TransactionManager::default();
        tm.begin(1);
        tm.lock(1, &res(1), LockMode::Shared).unwrap();
        let err = tm.lock(1, &res(1), LockMode::Exclusive).unwrap_err();
        assert!(matches!(err, StrataError::LockUpgradeForbidden { txn: 1 }));
    }

    #[test]
    fn test_unlock_checks_mode() {
        let tm = TransactionManager::default();
        tm.begin(1);
        assert!(matches!(
            tm.unlock(1, &res(1), LockMode::Shared),
            Err(StrataError::NotLocked { .. })
        ));
        tm.lock(1, &res(1), LockMode::Shared).unwrap();
        assert!(matches!(
            tm.unlock(1, &res(1), LockMode::Exclusive),
            Err(StrataError::ModeMismatch { .. })
        ));
        tm.unlock(1, &res(1), LockMode::Shared).unwrap();
        assert!(tm.held_locks(1).is_empty());
    }

    #[test]
    fn test_unlock_keeps_written_resources() {
        let tm = TransactionManager::default();
        tm.begin(1);
        tm.lock(1, &res(1), LockMode::Exclusive).unwrap();
        tm.lock(1, &res(2), LockMode::Exclusive).unwrap();
        tm.record_write(1, &res(1));

        assert!(matches!(
            tm.unlock(1, &res(1), LockMode::Exclusive),
            Err(StrataError::UncommittedWrite { txn: 1, .. })
        ));
        tm.unlock(1, &res(2), LockMode::Exclusive).unwrap();
        assert_eq!(tm.held_locks(1), vec![(res(1), LockMode::Exclusive)]);

        tm.commit(1).unwrap();
        tm.begin(1);
        tm.lock(1, &res(1), LockMode::Exclusive).unwrap();
        tm.unlock(1, &res(1), LockMode::Exclusive).unwrap();
    }

    #[test]
    fn test_commit_releases_and_forgets() {
        let tm = Arc::new(TransactionManager::default());
        tm.begin(1);
        tm.begin(2);
        tm.lock(1, &res(1), LockMode::Exclusive).unwrap();

        let waiter = {
            let tm = Arc::clone(&tm);
            std::thread::spawn(move || tm.lock(2, &res(1), LockMode::Exclusive))
        };
        while tm.waits_for_snapshot().is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(tm.waits_for_snapshot(), vec![(2, 1)]);

        tm.commit(1).unwrap();
        waiter.join().unwrap().unwrap();
        assert!(!tm.is_active(1));
        assert!(matches!(tm.commit(1), Err(StrataError::UnknownTransaction(1))));
        assert_eq!(tm.held_locks(2), vec![(res(1), LockMode::Exclusive)]);
        tm.rollback(2).unwrap();
        assert!(tm.active_transactions().is_empty());
    }

    #[test]
    fn test_begin_advances_id_counter() {
        let tm = TransactionManager::new(1);
        assert_eq!(tm.next_txn_id(), 1);
        tm.begin(10);
        assert_eq!(tm.next_txn_id(), 11);
        tm.advance_txn_id(5);
        assert_eq!(tm.next_txn_id(), 12);
    }
}
