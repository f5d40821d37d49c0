//! # nexus-txn
//!
//! Table-level lock management for NexusDB transactions.
//!
//! This crate provides:
//!
//! - **Lock Management**: Shared (S) and exclusive (X) locks on named
//!   resources, granted in per-resource FIFO order with Shared batching.
//!
//! - **Deadlock Prevention**: A waits-for graph shared by all resources. A
//!   request that would close a cycle is rejected with
//!   [`LockError::DeadlockDetected`] before it waits.
//!
//! - **Cancellation**: A suspended request can be withdrawn so that an
//!   aborting transaction never stays parked in a lock queue.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      LockManager                         │
//! │                           │                              │
//! │        ┌──────────────────┴──────────────────┐           │
//! │        │                                     │           │
//! │        ▼                                     ▼           │
//! │ ┌────────────────────┐            ┌────────────────────┐ │
//! │ │ DashMap<name,Lock> │            │ Mutex<WaitForGraph>│ │
//! │ └────────────────────┘            └────────────────────┘ │
//! │        │                                                 │
//! │        ▼                                                 │
//! │ ┌────────────────────────────┐                           │
//! │ │ Lock: Mutex<LockState> +   │                           │
//! │ │       Condvar              │                           │
//! │ └────────────────────────────┘                           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use nexus_common::types::TxnId;
//! use nexus_txn::{LockManager, LockMode};
//!
//! let lm = Arc::new(LockManager::new());
//! let txn = TxnId::new(1);
//!
//! lm.acquire_lock("orders", txn, LockMode::Shared).unwrap();
//! assert!(lm.holds_lock("orders", txn, LockMode::Shared));
//! assert!(!lm.holds_lock("orders", txn, LockMode::Exclusive));
//!
//! // End of transaction
//! assert_eq!(lm.release_all(txn), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Lock manager façade.
///
/// This module provides:
/// - [`manager::LockManager`]: Owns the resource table and waits-for graph
/// - [`manager::LockManagerConfig`]: Table sizing
/// - [`manager::LockStats`]: Counters
pub mod manager;

/// Per-resource lock monitor.
///
/// This module provides:
/// - [`lock::Lock`]: Owners, mode and FIFO queue of one resource
/// - [`lock::LockMode`]: Shared and Exclusive
/// - [`lock::Grant`]: How an acquire was resolved
pub mod lock;

/// Deadlock prevention.
///
/// This module provides:
/// - [`deadlock::WaitForGraph`]: Tracks which transactions wait on which
pub mod deadlock;

/// Lock manager errors.
pub mod error;

// Re-export commonly used types

pub use manager::{LockManager, LockManagerConfig, LockStats};

pub use lock::{Grant, Lock, LockMode, LockRequest, LockState};

pub use deadlock::WaitForGraph;

pub use error::{LockError, LockResult};
