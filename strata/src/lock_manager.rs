//! Manages locks on `(table, key)` resources.
//!
//! The lock table and the waits-for graph share one mutex, so adding a
//! waiter's edges and checking them for a cycle is atomic with respect to every
//! other request. Each resource has its own condition variable for waiters.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, StrataError};
use crate::{Key, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A lockable unit: one key of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Resource {
    pub table: String,
    pub key: Key,
}

impl Resource {
    pub fn new(table: impl Into<String>, key: Key) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

#[derive(Debug, Default)]
struct LockQueue {
    sharing: HashSet<TxnId>,
    exclusive: Option<TxnId>,
    waiting: usize,
    cvar: Arc<Condvar>,
}

impl LockQueue {
    /// Holders other than `txn` whose locks conflict with a `mode` request.
    fn conflicting_holders(&self, txn: TxnId, mode: LockMode) -> HashSet<TxnId> {
        let mut holders = HashSet::new();
        if let Some(holder) = self.exclusive {
            if holder != txn {
                holders.insert(holder);
            }
        }
        if mode == LockMode::Exclusive {
            holders.extend(self.sharing.iter().copied().filter(|h| *h != txn));
        }
        holders
    }

    fn is_idle(&self) -> bool {
        self.sharing.is_empty() && self.exclusive.is_none() && self.waiting == 0
    }
}

#[derive(Debug, Default)]
struct LockTable {
    queues: HashMap<Resource, LockQueue>,
    waits_for: HashMap<TxnId, HashSet<TxnId>>,
}

impl LockTable {
    /// True if following waits-for edges from `txn` leads back to `txn`.
    fn has_cycle_through(&self, txn: TxnId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<TxnId> = self
            .waits_for
            .get(&txn)
            .map(|edges| edges.iter().copied().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if current == txn {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(edges) = self.waits_for.get(&current) {
                stack.extend(edges.iter().copied());
            }
        }
        false
    }

    fn forget_waiter(&mut self, txn: TxnId) {
        self.waits_for.remove(&txn);
    }

    fn drop_if_idle(&mut self, resource: &Resource) {
        if self.queues.get(resource).is_some_and(LockQueue::is_idle) {
            self.queues.remove(resource);
        }
    }
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `txn` holds `resource` in `mode`, or fails with
    /// `DeadlockDetected` when waiting would close a cycle. Upgrade rules are
    /// enforced by the caller.
    pub fn acquire(&self, txn: TxnId, resource: &Resource, mode: LockMode) -> Result<()> {
        let mut table = self.table.lock();
        let mut waited = false;
        loop {
            let queue = table.queues.entry(resource.clone()).or_default();
            if waited {
                queue.waiting -= 1;
            }

            let holders = queue.conflicting_holders(txn, mode);
            if holders.is_empty() {
                match mode {
                    LockMode::Shared => {
                        queue.sharing.insert(txn);
                    }
                    LockMode::Exclusive => queue.exclusive = Some(txn),
                }
                table.forget_waiter(txn);
                trace!("txn {} acquired {:?} on {}", txn, mode, resource);
                return Ok(());
            }

            queue.waiting += 1;
            let cvar = Arc::clone(&queue.cvar);
            table.waits_for.insert(txn, holders);
            if table.has_cycle_through(txn) {
                if let Some(queue) = table.queues.get_mut(resource) {
                    queue.waiting -= 1;
                }
                table.forget_waiter(txn);
                table.drop_if_idle(resource);
                debug!("deadlock: txn {} waiting for {:?} on {}", txn, mode, resource);
                return Err(StrataError::DeadlockDetected { txn });
            }

            trace!("txn {} waits for {:?} on {}", txn, mode, resource);
            cvar.wait(&mut table);
            waited = true;
        }
    }

    /// Releases one lock without blocking and wakes its waiters.
    pub fn release(&self, txn: TxnId, resource: &Resource) {
        let mut table = self.table.lock();
        Self::release_locked(&mut table, txn, resource);
    }

    /// Releases every listed lock of `txn` and removes it from the graph.
    pub fn release_all<'a>(&self, txn: TxnId, resources: impl IntoIterator<Item = &'a Resource>) {
        let mut table = self.table.lock();
        for resource in resources {
            Self::release_locked(&mut table, txn, resource);
        }
        table.forget_waiter(txn);
        for edges in table.waits_for.values_mut() {
            edges.remove(&txn);
        }
    }

    fn release_locked(table: &mut LockTable, txn: TxnId, resource: &Resource) {
        let Some(queue) = table.queues.get_mut(resource) else {
            return;
        };
        if queue.exclusive == Some(txn) {
            queue.exclusive = None;
        }
        queue.sharing.remove(&txn);
        queue.cvar.notify_all();
        table.drop_if_idle(resource);
    }

    /// Current waits-for edges as `(waiter, holder)` pairs, sorted.
    pub fn waits_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        let table = self.table.lock();
        let mut edges: Vec<(TxnId, TxnId)> = table
            .waits_for
            .iter()
            .flat_map(|(waiter, holders)| holders.iter().map(move |h| (*waiter, *h)))
            .collect();
        edges.sort_unstable();
        edges
    }
}
