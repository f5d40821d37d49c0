//! Type definitions for NexusDB.
//!
//! This module contains the identifier types shared across crates.

mod ids;

pub use ids::TxnId;
