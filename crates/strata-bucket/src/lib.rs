//! Bucket engine for the strata ledger store.
//!
//! Ledger state in strata is kept in an append-only, content-addressed,
//! log-structured store organized as immutable sorted files called buckets.
//! This crate implements one bucket's behavior in isolation:
//!
//! - Building a fresh bucket from batches of created, updated, and deleted
//!   ledger entries
//! - Merging two ordered buckets under a set of shadow buckets into a new
//!   bucket, preserving entry-lifecycle invariants across protocol versions
//! - Point and range lookup through an on-demand index with bloom filtering
//! - A byte-budgeted, resumable eviction scan that deletes expired temporary
//!   entries through a ledger transaction
//!
//! The level hierarchy that decides *which* buckets merge *when* lives above
//! this crate; here a bucket only knows its own file, hash, and index.
//!
//! # Entry Lifecycle
//!
//! Bucket entries come in four kinds with protocol-versioned merge semantics:
//!
//! - [`BucketEntry::Live`]: the current value at a key
//! - [`BucketEntry::Init`]: first-ever creation of a key (the prior state at
//!   the key is DEAD or nonexistent)
//! - [`BucketEntry::Dead`]: a tombstone
//! - [`BucketEntry::Meta`]: the leading record carrying the protocol version
//!
//! From protocol 11 on, INIT+DEAD pairs annihilate during merges and DEAD+INIT
//! collapses to LIVE; shadows may then elide only LIVE records, never INIT or
//! DEAD, so that annihilation can never resurrect older state. From protocol
//! 12 on, shadows are gone entirely.
//!
//! # Identity
//!
//! A bucket is identified by the SHA-256 of its exact file bytes, computed
//! while writing. Two merges with the same inputs produce byte-identical
//! files, which is what lets the [`BucketManager`] deduplicate merge results
//! by hash.
//!
//! # Example
//!
//! ```ignore
//! use strata_bucket::{Bucket, BucketManager, BucketManagerConfig};
//!
//! let manager = BucketManager::new("/var/lib/strata/buckets".into())?;
//!
//! // Build a fresh bucket from one ledger's changes.
//! let bucket = Bucket::fresh(&manager, 12, init_entries, live_entries, dead_entries, true)?;
//!
//! // Merge it with an older bucket.
//! let merged = Bucket::merge(&manager, 12, &old, &bucket, &[], true, true, true)?;
//!
//! // Look up a key through the index.
//! if let Some(entry) = merged.get_bucket_entry(&key)? {
//!     // ...
//! }
//! ```

mod bloom;
mod bucket;
mod entry;
mod error;
mod eviction;
mod index;
mod iterator;
mod manager;
mod merge;
mod metrics;
pub mod model;

pub use strata_common::Hash256;

pub use bloom::{BucketBloomFilter, HashSeed, HASH_KEY_BYTES};
pub use bucket::Bucket;
pub use entry::{check_protocol_legality, compare_entries, BucketEntry, BucketMetadata};
pub use error::BucketError;
pub use eviction::{EvictionIterator, LedgerTxn};
pub use index::{BucketIndex, IndexCursor, RangeEntry, DEFAULT_PAGE_SIZE, INDIVIDUAL_INDEX_MAX_BYTES};
pub use iterator::{BucketInputIterator, BucketOutputIterator};
pub use manager::{BucketManager, BucketManagerConfig, BucketMergeMap};
pub use merge::MergeKey;
pub use metrics::{EvictionCounters, EvictionMetrics, MergeCounters, MergeTimer};

// ============================================================================
// Protocol version constants
// ============================================================================

/// First protocol version supporting INIT and META records.
///
/// Merges at-or-after this version annihilate INIT+DEAD pairs and preserve
/// INIT/DEAD records under shadows.
pub const FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY: u32 = 11;

/// First protocol version where bucket shadows are removed.
///
/// Passing shadows to a merge whose computed version reaches this constant is
/// a fatal error.
pub const FIRST_PROTOCOL_SHADOWS_REMOVED: u32 = 12;

/// First protocol version with evictable (TTL-bearing) contract state.
///
/// Buckets written before this version are skipped by the eviction scan.
pub const SOROBAN_PROTOCOL_VERSION: u32 = 20;

/// Result type for bucket operations.
pub type Result<T> = std::result::Result<T, BucketError>;
