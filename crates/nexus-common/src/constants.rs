//! System-wide constants for NexusDB.
//!
//! This module defines sizing defaults shared by the lock manager and the
//! components that embed it.

// =============================================================================
// Lock Table Constants
// =============================================================================

/// Default initial capacity of the resource lock table.
///
/// Tables are locked at table granularity, so a few hundred entries cover
/// most catalogs without rehashing.
pub const DEFAULT_LOCK_TABLE_CAPACITY: usize = 256;

/// Default number of shards in the resource lock table.
///
/// Must be a power of two greater than one.
pub const DEFAULT_LOCK_TABLE_SHARDS: usize = 16;

/// Maximum number of shards accepted for the resource lock table.
pub const MAX_LOCK_TABLE_SHARDS: usize = 1024;
