//! Lock manager façade.
//!
//! The [`LockManager`] owns the resource table and the single waits-for
//! graph shared by every resource. Callers share one instance through an
//! `Arc` and use two call sites: acquire before touching a table, release
//! at the end of the transaction.
//!
//! # Acquire Path
//!
//! ```text
//! acquire_lock(resource, txn, mode)
//!   │
//!   ├─ find or create Lock          (DashMap entry, atomic)
//!   ├─ enter Lock monitor           ─┐
//!   ├─ deadlock pre-check            │ graph mutex held for check + commit
//!   ├─ grant or suspend on Condvar   │
//!   └─ record holding, prune edges  ─┘
//! ```
//!
//! # Lock Ordering
//!
//! Lock monitor → per-transaction holdings → waits-for graph. Resource table
//! shard guards are never held while entering a monitor.
//!
//! # Graph Maintenance
//!
//! An edge `W -> H` exists exactly while `W` is queued on a lock owned by
//! `H`. Whenever the owners of a lock change, the edges of every request
//! still queued on it are reset to the new owners. A transaction's node is
//! dropped once it owns nothing and waits on nothing.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use nexus_common::constants::{
    DEFAULT_LOCK_TABLE_CAPACITY, DEFAULT_LOCK_TABLE_SHARDS, MAX_LOCK_TABLE_SHARDS,
};
use nexus_common::types::TxnId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::deadlock::WaitForGraph;
use crate::error::{LockError, LockResult};
use crate::lock::{Grant, Lock, LockMode, LockState};

/// Statistics about the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Total lock acquisitions.
    pub acquisitions: AtomicU64,
    /// Acquisitions granted without waiting.
    pub immediate_grants: AtomicU64,
    /// Total lock releases.
    pub releases: AtomicU64,
    /// Total requests that had to wait.
    pub waits: AtomicU64,
    /// Total deadlocks detected.
    pub deadlocks: AtomicU64,
    /// Total waits cancelled.
    pub cancellations: AtomicU64,
}

impl LockStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful acquisition.
    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records an acquisition that did not wait.
    pub fn record_immediate_grant(&self) {
        self.immediate_grants.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a release.
    pub fn record_release(&self) {
        self.releases.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a wait.
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a deadlock.
    pub fn record_deadlock(&self) {
        self.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Records a cancelled wait.
    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Configuration for the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Initial capacity of the resource table.
    pub table_capacity: usize,
    /// Number of shards in the resource table. Must be a power of two > 1.
    pub table_shards: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            table_capacity: DEFAULT_LOCK_TABLE_CAPACITY,
            table_shards: DEFAULT_LOCK_TABLE_SHARDS,
        }
    }
}

impl LockManagerConfig {
    /// Sets the initial table capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.table_capacity = capacity;
        self
    }

    /// Sets the number of table shards.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.table_shards = shards;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.table_shards < 2 {
            return Err("table_shards must be > 1");
        }
        if !self.table_shards.is_power_of_two() {
            return Err("table_shards must be a power of 2");
        }
        if self.table_shards > MAX_LOCK_TABLE_SHARDS {
            return Err("table_shards exceeds MAX_LOCK_TABLE_SHARDS");
        }
        Ok(())
    }

    /// Returns the shard count rounded into the accepted range.
    fn effective_shards(&self) -> usize {
        self.table_shards
            .clamp(2, MAX_LOCK_TABLE_SHARDS)
            .next_power_of_two()
    }
}

/// The lock manager for table-level transaction locks.
pub struct LockManager {
    /// All locks, keyed by resource name. Entries are never removed.
    locks: DashMap<String, Arc<Lock>>,
    /// Resources held by each transaction.
    txn_locks: RwLock<HashMap<TxnId, HashSet<String>>>,
    /// Lock each suspended transaction is queued on.
    waiting_on: DashMap<TxnId, Arc<Lock>>,
    /// The waits-for graph shared by all resources.
    graph: Mutex<WaitForGraph>,
    /// Configuration.
    config: LockManagerConfig,
    /// Statistics.
    stats: LockStats,
}

impl LockManager {
    /// Creates a new lock manager with default configuration.
    pub fn new() -> Self {
        Self::with_config(LockManagerConfig::default())
    }

    /// Creates a lock manager with custom configuration.
    ///
    /// An out-of-range shard count is rounded to the nearest accepted value.
    pub fn with_config(config: LockManagerConfig) -> Self {
        if let Err(reason) = config.validate() {
            warn!(reason, shards = config.table_shards, "adjusting lock table shard count");
        }
        Self {
            locks: DashMap::with_capacity_and_shard_amount(
                config.table_capacity,
                config.effective_shards(),
            ),
            txn_locks: RwLock::new(HashMap::new()),
            waiting_on: DashMap::new(),
            graph: Mutex::new(WaitForGraph::new()),
            config,
            stats: LockStats::new(),
        }
    }

    /// Returns the lock for `resource`, creating it on first reference.
    fn lock_for(&self, resource: &str) -> Arc<Lock> {
        if let Some(lock) = self.locks.get(resource) {
            return Arc::clone(lock.value());
        }
        let entry = self
            .locks
            .entry(resource.to_owned())
            .or_insert_with(|| Arc::new(Lock::new(resource)));
        Arc::clone(entry.value())
    }

    /// Returns the lock for `resource` if it has been referenced.
    fn existing_lock(&self, resource: &str) -> Option<Arc<Lock>> {
        self.locks.get(resource).map(|lock| Arc::clone(lock.value()))
    }

    /// Acquires `mode` on `resource` for `txn_id`, blocking until granted.
    ///
    /// Fails with [`LockError::DeadlockDetected`] without granting or
    /// recording anything if waiting would close a cycle, and with
    /// [`LockError::Cancelled`] if the wait is withdrawn by
    /// [`cancel_wait`](Self::cancel_wait). Re-acquiring a held lock is a
    /// no-op.
    pub fn acquire_lock(&self, resource: &str, txn_id: TxnId, mode: LockMode) -> LockResult<()> {
        let lock = self.lock_for(resource);
        let mut state = lock.lock_state();

        let must_wait = !state.can_grant(txn_id, mode);
        self.check_deadlock(&state, resource, txn_id, mode, must_wait)?;

        if must_wait {
            self.stats.record_wait();
            self.waiting_on.insert(txn_id, Arc::clone(&lock));
            debug!(txn = %txn_id, resource, %mode, owners = state.owners().len(), "lock request waiting");
        }

        let grant = lock.acquire_locked(&mut state, txn_id, mode);
        if must_wait {
            self.waiting_on.remove(&txn_id);
        }

        match grant {
            Grant::AlreadyHeld => {
                trace!(txn = %txn_id, resource, %mode, "lock already held");
                Ok(())
            }
            Grant::Granted => {
                self.record_holding(txn_id, resource);
                if state.waiter_count() > 0 {
                    // A Shared joiner is a new owner that queued requests now wait on.
                    let mut graph = self.graph.lock();
                    Self::reset_waiter_edges(&mut graph, &state);
                }
                self.stats.record_acquisition();
                self.stats.record_immediate_grant();
                trace!(txn = %txn_id, resource, %mode, "lock granted");
                Ok(())
            }
            Grant::GrantedAfterWait => {
                // Holding and edges were updated by the thread that granted us.
                debug_assert!(!self.graph.lock().is_waiting(txn_id));
                self.stats.record_acquisition();
                debug!(txn = %txn_id, resource, %mode, "lock granted after wait");
                Ok(())
            }
            Grant::Withdrawn => Err(LockError::cancelled(txn_id, resource)),
        }
    }

    /// Deadlock pre-check, run inside the lock's monitor.
    ///
    /// Shared against Shared never waits, so the graph is skipped. This
    /// looks at the aggregate mode rather than each owner's, which is exact
    /// for a two-mode lock. Otherwise every owner other than `txn_id` is
    /// tested before anything is committed, and the edges are committed only
    /// when the request will actually wait.
    fn check_deadlock(
        &self,
        state: &LockState,
        resource: &str,
        txn_id: TxnId,
        mode: LockMode,
        must_wait: bool,
    ) -> LockResult<()> {
        if state.mode() == Some(LockMode::Shared) && mode == LockMode::Shared {
            return Ok(());
        }

        let mut holders: Vec<TxnId> = state
            .owners()
            .iter()
            .copied()
            .filter(|&owner| owner != txn_id)
            .collect();
        if holders.is_empty() {
            return Ok(());
        }
        holders.sort_unstable();

        let mut graph = self.graph.lock();
        for &holder in &holders {
            if let Some(path) = graph.find_path(holder, txn_id) {
                self.stats.record_deadlock();
                warn!(
                    txn = %txn_id,
                    holder = %holder,
                    resource,
                    %mode,
                    cycle = ?path,
                    "deadlock detected, rejecting lock request"
                );
                return Err(LockError::deadlock(txn_id, resource, holder));
            }
        }

        if must_wait {
            for holder in holders {
                graph.add_edge(txn_id, holder);
            }
            debug_assert!(graph.find_cycle(txn_id).is_none());
        }
        Ok(())
    }

    /// Points every queued request of a lock at its current owners.
    fn reset_waiter_edges(graph: &mut WaitForGraph, state: &LockState) {
        for waiter in state.waiters() {
            graph.set_waits(waiter.txn_id, state.owners().iter().copied());
        }
    }

    /// Records that `txn_id` owns `resource`.
    fn record_holding(&self, txn_id: TxnId, resource: &str) {
        self.txn_locks
            .write()
            .entry(txn_id)
            .or_default()
            .insert(resource.to_owned());
    }

    /// Applies the bookkeeping of a change in a lock's owners.
    ///
    /// `granted` were just promoted from the queue; `left` gave up the lock
    /// or its queued request. Runs inside the lock's monitor.
    fn after_owner_change(
        &self,
        state: &LockState,
        resource: &str,
        granted: &[TxnId],
        left: TxnId,
        released: bool,
    ) {
        let mut txn_locks = self.txn_locks.write();
        let mut left_idle = true;
        if released {
            if let Some(held) = txn_locks.get_mut(&left) {
                held.remove(resource);
                left_idle = held.is_empty();
                if left_idle {
                    txn_locks.remove(&left);
                }
            }
        } else {
            left_idle = !txn_locks.contains_key(&left);
        }
        for &txn_id in granted {
            txn_locks
                .entry(txn_id)
                .or_default()
                .insert(resource.to_owned());
        }

        let mut graph = self.graph.lock();
        if !released {
            graph.clear_waits(left);
        }
        for &txn_id in granted {
            graph.clear_waits(txn_id);
        }
        Self::reset_waiter_edges(&mut graph, state);
        if left_idle && !graph.is_waiting(left) && graph.contains_node(left) {
            graph.remove_node(left);
        }
    }

    /// Releases `txn_id`'s hold on `resource`.
    ///
    /// Returns false, changing nothing, if the resource is unknown or not
    /// held by `txn_id`.
    pub fn release_lock(&self, resource: &str, txn_id: TxnId) -> bool {
        let Some(lock) = self.existing_lock(resource) else {
            return false;
        };
        let mut state = lock.lock_state();
        let Some(granted) = state.release(txn_id) else {
            return false;
        };

        self.after_owner_change(&state, resource, &granted, txn_id, true);
        self.stats.record_release();
        trace!(txn = %txn_id, resource, granted = granted.len(), "lock released");

        if !granted.is_empty() {
            lock.wake_waiters();
        }
        true
    }

    /// Releases all locks held by a transaction. Returns how many were held.
    pub fn release_all(&self, txn_id: TxnId) -> usize {
        let resources = self.locks_held(txn_id);
        resources
            .iter()
            .filter(|resource| self.release_lock(resource, txn_id))
            .count()
    }

    /// Withdraws the suspended request of `txn_id`, if any.
    ///
    /// The blocked `acquire_lock` call returns [`LockError::Cancelled`].
    /// Returns false if `txn_id` was not waiting.
    pub fn cancel_wait(&self, txn_id: TxnId) -> bool {
        let Some(lock) = self
            .waiting_on
            .get(&txn_id)
            .map(|lock| Arc::clone(lock.value()))
        else {
            return false;
        };

        let mut state = lock.lock_state();
        let Some(granted) = state.withdraw(txn_id) else {
            // Granted or already withdrawn in the meantime.
            return false;
        };

        self.after_owner_change(&state, lock.name(), &granted, txn_id, false);
        self.stats.record_cancellation();
        warn!(txn = %txn_id, resource = lock.name(), granted = granted.len(), "lock wait cancelled");

        lock.wake_waiters();
        true
    }

    /// Returns true if `txn_id` holds `resource` in exactly `mode`.
    pub fn holds_lock(&self, resource: &str, txn_id: TxnId, mode: LockMode) -> bool {
        self.existing_lock(resource)
            .is_some_and(|lock| lock.holds(txn_id, mode))
    }

    /// Returns the resources held by a transaction, sorted.
    pub fn locks_held(&self, txn_id: TxnId) -> Vec<String> {
        let mut resources: Vec<String> = self
            .txn_locks
            .read()
            .get(&txn_id)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default();
        resources.sort_unstable();
        resources
    }

    /// Returns true if `txn_id` is suspended in `acquire_lock`.
    pub fn is_waiting(&self, txn_id: TxnId) -> bool {
        self.waiting_on.contains_key(&txn_id)
    }

    /// Returns a copy of the current wait edges.
    pub fn graph_snapshot(&self) -> Vec<(TxnId, TxnId)> {
        self.graph.lock().edges()
    }

    /// Returns the transactions `txn_id` currently waits for, sorted.
    pub fn waits_for(&self, txn_id: TxnId) -> Vec<TxnId> {
        self.graph.lock().waits_for(txn_id)
    }

    /// Returns true if the transaction is a node of the waits-for graph.
    pub fn in_graph(&self, txn_id: TxnId) -> bool {
        self.graph.lock().contains_node(txn_id)
    }

    /// Returns the mode and owners of a resource, or `None` if unknown.
    pub fn lock_info(&self, resource: &str) -> Option<(Option<LockMode>, Vec<TxnId>)> {
        let lock = self.existing_lock(resource)?;
        let state = lock.lock_state();
        let mut owners: Vec<TxnId> = state.owners().iter().copied().collect();
        owners.sort_unstable();
        Some((state.mode(), owners))
    }

    /// Returns statistics about the lock manager.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Returns the configuration.
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Returns the number of resources ever referenced.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Returns the number of transactions holding locks.
    pub fn txn_count(&self) -> usize {
        self.txn_locks.read().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_count", &self.lock_count())
            .field("txn_count", &self.txn_count())
            .finish()
    }
}
