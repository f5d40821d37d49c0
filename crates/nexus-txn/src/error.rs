//! Lock manager errors.

use nexus_common::types::TxnId;
use thiserror::Error;

/// Result type for lock manager operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors returned by [`crate::LockManager::acquire_lock`].
///
/// Neither error is retried internally. The caller's transaction is
/// expected to abort and release whatever it already holds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum LockError {
    /// Waiting for `holder` would close a cycle in the waits-for graph.
    #[error("deadlock detected: transaction {txn_id} cannot wait on {holder} for '{resource}'")]
    DeadlockDetected {
        txn_id: TxnId,
        resource: String,
        holder: TxnId,
    },

    /// The suspended request was withdrawn through `cancel_wait`.
    #[error("lock request of transaction {txn_id} on '{resource}' was cancelled")]
    Cancelled { txn_id: TxnId, resource: String },
}

impl LockError {
    /// Creates a deadlock error.
    pub fn deadlock(txn_id: TxnId, resource: impl Into<String>, holder: TxnId) -> Self {
        Self::DeadlockDetected {
            txn_id,
            resource: resource.into(),
            holder,
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(txn_id: TxnId, resource: impl Into<String>) -> Self {
        Self::Cancelled {
            txn_id,
            resource: resource.into(),
        }
    }

    /// Returns true if this error reports a deadlock.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::DeadlockDetected { .. })
    }

    /// Returns true if the request was cancelled while waiting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the transaction whose request failed.
    pub fn txn_id(&self) -> TxnId {
        match self {
            Self::DeadlockDetected { txn_id, .. } | Self::Cancelled { txn_id, .. } => *txn_id,
        }
    }
}
