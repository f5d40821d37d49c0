//! Per-resource lock monitor.
//!
//! Every lockable resource (a table) owns one [`Lock`]: a mutex-protected
//! [`LockState`] plus a condition variable that suspended requests sleep on.
//!
//! # Lock Compatibility Matrix
//!
//! ```text
//!          │ S  │ X  │
//! ─────────┼────┼────┤
//!     S    │ ✓  │ ✗  │
//!     X    │ ✗  │ ✗  │
//! ```
//!
//! # Grant Order
//!
//! A request is granted on arrival when the lock is free, when it is a
//! Shared request against a Shared lock, or when the caller already owns the
//! lock. Anything else joins a FIFO queue. When the last owner leaves, the
//! queue head is granted, followed by every contiguous Shared request behind
//! it; the first Exclusive request stops the batch.
//!
//! ```text
//! queue: [S(T4), S(T5), X(T6), S(T7)]   owners: {} after release
//! grant: T4, T5                          owners: {T4, T5} in S
//! ```

use std::collections::{HashSet, VecDeque};
use std::fmt;

use nexus_common::types::TxnId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

/// Lock mode for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock (read lock).
    Shared,
    /// Exclusive lock (write lock).
    Exclusive,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    ///
    /// Only Shared/Shared is compatible. Exclusive conflicts with everything,
    /// itself included.
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// A pending lock request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Transaction requesting the lock.
    pub txn_id: TxnId,
    /// Requested lock mode.
    pub mode: LockMode,
}

impl LockRequest {
    /// Creates a new lock request.
    pub fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self { txn_id, mode }
    }
}

/// How an acquire call was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// Lock was granted immediately.
    Granted,
    /// Transaction already owned the lock; nothing changed.
    AlreadyHeld,
    /// Lock was granted after waiting in the queue.
    GrantedAfterWait,
    /// The queued request was withdrawn before it could be granted.
    Withdrawn,
}

impl Grant {
    /// Returns true if the caller owns the lock.
    pub fn is_granted(&self) -> bool {
        !matches!(self, Grant::Withdrawn)
    }
}

/// Mutable state of a lock, guarded by the lock's mutex.
///
/// Invariants: `mode` is `None` exactly when `owners` is empty; an
/// Exclusive lock has a single owner; a transaction is never both an owner
/// and queued.
#[derive(Debug, Default)]
pub struct LockState {
    /// Current mode, `None` when free.
    mode: Option<LockMode>,
    /// Transactions holding the lock.
    owners: HashSet<TxnId>,
    /// Queue of waiting lock requests.
    wait_queue: VecDeque<LockRequest>,
}

impl LockState {
    /// Returns the current mode, or `None` if the lock is free.
    pub fn mode(&self) -> Option<LockMode> {
        self.mode
    }

    /// Returns the owning transactions.
    pub fn owners(&self) -> &HashSet<TxnId> {
        &self.owners
    }

    /// Returns true if `txn_id` owns the lock.
    pub fn is_owner(&self, txn_id: TxnId) -> bool {
        self.owners.contains(&txn_id)
    }

    /// Returns true if nobody owns the lock.
    pub fn is_free(&self) -> bool {
        self.owners.is_empty()
    }

    /// Returns the queued requests in arrival order.
    pub fn waiters(&self) -> impl Iterator<Item = &LockRequest> {
        self.wait_queue.iter()
    }

    /// Returns the number of queued requests.
    pub fn waiter_count(&self) -> usize {
        self.wait_queue.len()
    }

    /// Returns true if `txn_id` has a queued request.
    pub fn is_queued(&self, txn_id: TxnId) -> bool {
        self.wait_queue.iter().any(|r| r.txn_id == txn_id)
    }

    /// Returns true if `txn_id` holds the lock in exactly `mode`.
    pub fn holds(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.mode == Some(mode) && self.owners.contains(&txn_id)
    }

    /// Checks if a request can be granted without waiting.
    pub fn can_grant(&self, txn_id: TxnId, mode: LockMode) -> bool {
        if self.owners.is_empty() || self.owners.contains(&txn_id) {
            return true;
        }
        self.mode.is_some_and(|current| mode.is_compatible_with(&current))
    }

    /// Adds an owner. The mode is installed only when the lock was free, so
    /// a re-entrant request never changes it.
    fn grant(&mut self, txn_id: TxnId, mode: LockMode) {
        if self.owners.is_empty() {
            self.mode = Some(mode);
        }
        self.owners.insert(txn_id);
    }

    /// Grants queued requests from the head while they are grantable.
    fn grant_waiters(&mut self) -> Vec<TxnId> {
        let mut granted = Vec::new();
        while let Some(head) = self.wait_queue.front() {
            let grantable = self.owners.is_empty()
                || self
                    .mode
                    .is_some_and(|current| head.mode.is_compatible_with(&current));
            if !grantable {
                break;
            }
            if let Some(request) = self.wait_queue.pop_front() {
                self.grant(request.txn_id, request.mode);
                granted.push(request.txn_id);
            }
        }
        granted
    }

    /// Removes `txn_id` from the owners and hands the lock to the queue.
    ///
    /// Returns `None` if `txn_id` was not an owner, otherwise the
    /// transactions granted as a result.
    pub fn release(&mut self, txn_id: TxnId) -> Option<Vec<TxnId>> {
        if !self.owners.remove(&txn_id) {
            return None;
        }
        if self.owners.is_empty() {
            self.mode = None;
        }
        Some(self.grant_waiters())
    }

    /// Withdraws the queued request of `txn_id`.
    ///
    /// Returns `None` if `txn_id` was not queued, otherwise the transactions
    /// granted because the withdrawn request no longer blocks them.
    pub fn withdraw(&mut self, txn_id: TxnId) -> Option<Vec<TxnId>> {
        let pos = self.wait_queue.iter().position(|r| r.txn_id == txn_id)?;
        self.wait_queue.remove(pos);
        Some(self.grant_waiters())
    }
}

/// A lock on a single named resource.
pub struct Lock {
    /// The resource this lock protects.
    name: String,
    /// Owners, mode and wait queue.
    state: Mutex<LockState>,
    /// Signalled whenever queued requests are granted or withdrawn.
    changed: Condvar,
}

impl Lock {
    /// Creates a free lock for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
        }
    }

    /// Returns the resource name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enters the monitor.
    pub fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock()
    }

    /// Acquires the lock, blocking until it is granted or withdrawn.
    pub fn acquire(&self, txn_id: TxnId, mode: LockMode) -> Grant {
        let mut state = self.state.lock();
        self.acquire_locked(&mut state, txn_id, mode)
    }

    /// Acquires the lock from inside the monitor.
    ///
    /// `state` must be the guard returned by [`lock_state`](Self::lock_state)
    /// on this lock. It is released while suspended and held again on return.
    pub fn acquire_locked(
        &self,
        state: &mut MutexGuard<'_, LockState>,
        txn_id: TxnId,
        mode: LockMode,
    ) -> Grant {
        if state.is_owner(txn_id) {
            return Grant::AlreadyHeld;
        }
        if state.can_grant(txn_id, mode) {
            state.grant(txn_id, mode);
            return Grant::Granted;
        }

        state.wait_queue.push_back(LockRequest::new(txn_id, mode));
        loop {
            self.changed.wait(state);
            if state.is_owner(txn_id) {
                return Grant::GrantedAfterWait;
            }
            if !state.is_queued(txn_id) {
                return Grant::Withdrawn;
            }
        }
    }

    /// Releases `txn_id`'s hold. Returns the transactions granted as a
    /// result, or `None` if `txn_id` was not an owner.
    pub fn release(&self, txn_id: TxnId) -> Option<Vec<TxnId>> {
        let mut state = self.state.lock();
        let granted = state.release(txn_id)?;
        if !granted.is_empty() {
            self.wake_waiters();
        }
        Some(granted)
    }

    /// Withdraws a queued request and wakes its caller.
    pub fn withdraw(&self, txn_id: TxnId) -> Option<Vec<TxnId>> {
        let mut state = self.state.lock();
        let granted = state.withdraw(txn_id)?;
        self.wake_waiters();
        Some(granted)
    }

    /// Returns true if `txn_id` holds the lock in exactly `mode`.
    pub fn holds(&self, txn_id: TxnId, mode: LockMode) -> bool {
        self.state.lock().holds(txn_id, mode)
    }

    /// Wakes every suspended request so each can re-check its status.
    pub fn wake_waiters(&self) {
        self.changed.notify_all();
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("mode", &state.mode)
            .field("owners", &state.owners.len())
            .field("waiters", &state.wait_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn t(id: u64) -> TxnId {
        TxnId::new(id)
    }

    /// Spins until `txn_id` shows up in the wait queue.
    fn wait_until_queued(lock: &Lock, txn_id: TxnId) {
        while !lock.lock_state().is_queued(txn_id) {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_lock_mode_compatibility() {
        use LockMode::*;

        assert!(Shared.is_compatible_with(&Shared));
        assert!(!Shared.is_compatible_with(&Exclusive));
        assert!(!Exclusive.is_compatible_with(&Shared));
        assert!(!Exclusive.is_compatible_with(&Exclusive));
    }

    #[test]
    fn test_lock_mode_display() {
        assert_eq!(format!("{}", LockMode::Shared), "S");
        assert_eq!(format!("{}", LockMode::Exclusive), "X");
    }

    #[test]
    fn test_free_lock_grants() {
        let lock = Lock::new("orders");

        assert_eq!(lock.acquire(t(1), LockMode::Exclusive), Grant::Granted);
        assert!(lock.holds(t(1), LockMode::Exclusive));
        assert!(!lock.holds(t(1), LockMode::Shared));
        assert_eq!(lock.lock_state().mode(), Some(LockMode::Exclusive));
    }

    #[test]
    fn test_shared_locks_concurrent() {
        let lock = Lock::new("orders");

        assert_eq!(lock.acquire(t(1), LockMode::Shared), Grant::Granted);
        assert_eq!(lock.acquire(t(2), LockMode::Shared), Grant::Granted);

        let state = lock.lock_state();
        assert_eq!(state.owners().len(), 2);
        assert_eq!(state.waiter_count(), 0);
    }

    #[test]
    fn test_reentrant_acquire_is_idempotent() {
        let lock = Lock::new("orders");

        assert_eq!(lock.acquire(t(1), LockMode::Shared), Grant::Granted);
        assert_eq!(lock.acquire(t(1), LockMode::Shared), Grant::AlreadyHeld);
        // No upgrade: the installed mode stays Shared.
        assert_eq!(lock.acquire(t(1), LockMode::Exclusive), Grant::AlreadyHeld);
        assert!(lock.holds(t(1), LockMode::Shared));
        assert!(!lock.holds(t(1), LockMode::Exclusive));
        assert_eq!(lock.lock_state().owners().len(), 1);

        // A single release frees it.
        assert_eq!(lock.release(t(1)), Some(vec![]));
        assert!(lock.lock_state().is_free());
        assert_eq!(lock.lock_state().mode(), None);
    }

    #[test]
    fn test_release_not_owner() {
        let lock = Lock::new("orders");

        assert_eq!(lock.release(t(1)), None);
        lock.acquire(t(1), LockMode::Shared);
        assert_eq!(lock.release(t(2)), None);
        assert!(lock.holds(t(1), LockMode::Shared));
    }

    #[test]
    fn test_release_drains_shared_batch() {
        let mut state = LockState::default();
        state.grant(t(1), LockMode::Exclusive);
        for (id, mode) in [
            (4, LockMode::Shared),
            (5, LockMode::Shared),
            (6, LockMode::Exclusive),
            (7, LockMode::Shared),
        ] {
            state.wait_queue.push_back(LockRequest::new(t(id), mode));
        }

        let granted = state.release(t(1)).unwrap();
        assert_eq!(granted, vec![t(4), t(5)]);
        assert_eq!(state.mode(), Some(LockMode::Shared));
        assert_eq!(state.waiter_count(), 2);

        state.release(t(4)).unwrap();
        let granted = state.release(t(5)).unwrap();
        assert_eq!(granted, vec![t(6)]);
        assert_eq!(state.mode(), Some(LockMode::Exclusive));

        let granted = state.release(t(6)).unwrap();
        assert_eq!(granted, vec![t(7)]);
        assert_eq!(state.waiter_count(), 0);
    }

    #[test]
    fn test_release_drains_exclusive_head_only() {
        let mut state = LockState::default();
        state.grant(t(1), LockMode::Shared);
        state.wait_queue.push_back(LockRequest::new(t(2), LockMode::Exclusive));
        state.wait_queue.push_back(LockRequest::new(t(3), LockMode::Shared));

        let granted = state.release(t(1)).unwrap();
        assert_eq!(granted, vec![t(2)]);
        assert!(state.holds(t(2), LockMode::Exclusive));
        assert!(state.is_queued(t(3)));
    }

    #[test]
    fn test_withdraw_unblocks_shared_behind() {
        let mut state = LockState::default();
        state.grant(t(1), LockMode::Shared);
        state.wait_queue.push_back(LockRequest::new(t(2), LockMode::Exclusive));
        state.wait_queue.push_back(LockRequest::new(t(3), LockMode::Shared));

        assert_eq!(state.withdraw(t(2)), Some(vec![t(3)]));
        assert!(state.holds(t(3), LockMode::Shared));
        assert_eq!(state.withdraw(t(2)), None);
    }

    #[test]
    fn test_exclusive_blocks_until_release() {
        let lock = Arc::new(Lock::new("orders"));
        lock.acquire(t(1), LockMode::Exclusive);

        let (tx, rx) = mpsc::channel();
        let handle = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                let grant = lock.acquire(t(2), LockMode::Shared);
                tx.send(grant).unwrap();
            })
        };

        wait_until_queued(&lock, t(2));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        assert_eq!(lock.release(t(1)), Some(vec![t(2)]));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Grant::GrantedAfterWait
        );
        handle.join().unwrap();
        assert!(lock.holds(t(2), LockMode::Shared));
    }

    #[test]
    fn test_withdraw_wakes_waiter() {
        let lock = Arc::new(Lock::new("orders"));
        lock.acquire(t(1), LockMode::Exclusive);

        let handle = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.acquire(t(2), LockMode::Exclusive))
        };

        wait_until_queued(&lock, t(2));
        assert_eq!(lock.withdraw(t(2)), Some(vec![]));
        assert_eq!(handle.join().unwrap(), Grant::Withdrawn);
        assert!(lock.holds(t(1), LockMode::Exclusive));
    }

    #[test]
    fn test_grant_is_granted() {
        assert!(Grant::Granted.is_granted());
        assert!(Grant::AlreadyHeld.is_granted());
        assert!(Grant::GrantedAfterWait.is_granted());
        assert!(!Grant::Withdrawn.is_granted());
    }
}
