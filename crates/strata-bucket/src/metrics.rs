//! Counters and timers for bucket operations.
//!
//! A merge owns a plain [`MergeCounters`] while it runs and folds it into the
//! manager's aggregate at completion; nothing here is shared mid-merge.
//! Eviction counters are atomics because the caller holds them across many
//! scan invocations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Merge counters
// ============================================================================

/// Statistics gathered while running one merge.
///
/// Every field is a plain count; the struct is folded into the manager's
/// aggregate under its lock via [`MergeCounters::add`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeCounters {
    /// Merges computed under a pre-INIT protocol version.
    pub pre_init_entry_protocol_merges: u64,
    /// Merges computed at-or-after the INIT-supporting protocol version.
    pub post_init_entry_protocol_merges: u64,

    /// Merges computed under a pre-shadow-removal protocol version.
    pub pre_shadow_removal_protocol_merges: u64,
    /// Merges computed at-or-after the shadow-removal protocol version.
    pub post_shadow_removal_protocol_merges: u64,

    /// Resubmitted merges resolved from the manager's memo instead of rerun.
    pub running_merge_reattachments: u64,

    /// Old-side entries consumed, by kind.
    pub old_meta_entries: u64,
    pub old_init_entries: u64,
    pub old_live_entries: u64,
    pub old_dead_entries: u64,

    /// New-side entries consumed, by kind.
    pub new_meta_entries: u64,
    pub new_init_entries: u64,
    pub new_live_entries: u64,
    pub new_dead_entries: u64,

    /// Entries accepted without a key collision.
    pub old_entries_default_accepted: u64,
    pub new_entries_default_accepted: u64,

    /// Equal-key outcomes.
    pub new_init_entries_merged_with_old_dead: u64,
    pub old_init_entries_merged_with_new_live: u64,
    pub old_init_entries_merged_with_new_dead: u64,
    pub new_entries_merged_with_old_neither_init: u64,

    /// Shadow cursor advances performed by `maybe_put`.
    pub shadow_scan_steps: u64,

    /// Entries elided because a shadow matched, by kind.
    pub meta_entry_shadow_elisions: u64,
    pub init_entry_shadow_elisions: u64,
    pub live_entry_shadow_elisions: u64,
    pub dead_entry_shadow_elisions: u64,
}

impl MergeCounters {
    /// Fold another counter set into this one.
    pub fn add(&mut self, other: &MergeCounters) {
        self.pre_init_entry_protocol_merges += other.pre_init_entry_protocol_merges;
        self.post_init_entry_protocol_merges += other.post_init_entry_protocol_merges;
        self.pre_shadow_removal_protocol_merges += other.pre_shadow_removal_protocol_merges;
        self.post_shadow_removal_protocol_merges += other.post_shadow_removal_protocol_merges;
        self.running_merge_reattachments += other.running_merge_reattachments;
        self.old_meta_entries += other.old_meta_entries;
        self.old_init_entries += other.old_init_entries;
        self.old_live_entries += other.old_live_entries;
        self.old_dead_entries += other.old_dead_entries;
        self.new_meta_entries += other.new_meta_entries;
        self.new_init_entries += other.new_init_entries;
        self.new_live_entries += other.new_live_entries;
        self.new_dead_entries += other.new_dead_entries;
        self.old_entries_default_accepted += other.old_entries_default_accepted;
        self.new_entries_default_accepted += other.new_entries_default_accepted;
        self.new_init_entries_merged_with_old_dead += other.new_init_entries_merged_with_old_dead;
        self.old_init_entries_merged_with_new_live += other.old_init_entries_merged_with_new_live;
        self.old_init_entries_merged_with_new_dead += other.old_init_entries_merged_with_new_dead;
        self.new_entries_merged_with_old_neither_init +=
            other.new_entries_merged_with_old_neither_init;
        self.shadow_scan_steps += other.shadow_scan_steps;
        self.meta_entry_shadow_elisions += other.meta_entry_shadow_elisions;
        self.init_entry_shadow_elisions += other.init_entry_shadow_elisions;
        self.live_entry_shadow_elisions += other.live_entry_shadow_elisions;
        self.dead_entry_shadow_elisions += other.dead_entry_shadow_elisions;
    }

    /// Total entries elided by shadowing, across kinds.
    pub fn total_shadow_elisions(&self) -> u64 {
        self.meta_entry_shadow_elisions
            + self.init_entry_shadow_elisions
            + self.live_entry_shadow_elisions
            + self.dead_entry_shadow_elisions
    }
}

// ============================================================================
// Merge timer
// ============================================================================

/// Wall-time accumulator for merges.
#[derive(Debug, Default)]
pub struct MergeTimer {
    merges_timed: AtomicU64,
    total_micros: AtomicU64,
}

impl MergeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one merge's duration.
    pub fn record(&self, elapsed: Duration) {
        self.merges_timed.fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Number of merges timed.
    pub fn count(&self) -> u64 {
        self.merges_timed.load(Ordering::Relaxed)
    }

    /// Total merge wall-time in microseconds.
    pub fn total_micros(&self) -> u64 {
        self.total_micros.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Eviction counters
// ============================================================================

/// Long-lived counters held by the eviction scan's caller.
#[derive(Debug, Default)]
pub struct EvictionCounters {
    /// Entries deleted by the scan.
    pub entries_evicted: AtomicU64,
    /// Bytes of bucket file consumed by the scan.
    pub bytes_scanned_for_eviction: AtomicU64,
}

impl EvictionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries_evicted(&self) -> u64 {
        self.entries_evicted.load(Ordering::Relaxed)
    }

    pub fn bytes_scanned(&self) -> u64 {
        self.bytes_scanned_for_eviction.load(Ordering::Relaxed)
    }
}

/// Per-run eviction statistics, reset by the caller each scan cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionMetrics {
    /// Entries evicted during this cycle.
    pub num_entries_evicted: u64,
    /// Sum over evicted entries of how many ledgers past expiry they were.
    pub evicted_entries_age_sum: u64,
}
