//! # nexus-common
//!
//! Common types and constants shared by NexusDB components.
//!
//! - **Types**: Core identifiers such as [`TxnId`]
//! - **Constants**: Sizing defaults for the lock table
//!
//! ## Example
//!
//! ```rust
//! use nexus_common::types::TxnId;
//!
//! let txn_id = TxnId::new(1);
//! assert_eq!(txn_id.as_u64(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::TxnId;
