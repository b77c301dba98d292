//! Bucket merging.
//!
//! Merging two read-only buckets (plus a set of shadow buckets) into a new
//! third bucket, computing its hash in a single pass, is the key operation of
//! the scheme. The loop walks both inputs in key order; colliding keys go
//! through a lifecycle table, everything else is accepted as-is, and every
//! accepted entry is offered to the shadows for possible elision before it
//! reaches the output.
//!
//! # Equal-key lifecycle table
//!
//! ```text
//!   old    |   new   |   result
//! ---------+---------+-----------
//!  INIT    |  INIT   |   error
//!  LIVE    |  INIT   |   error
//!  DEAD    |  INIT=x |   LIVE=x
//!  INIT=x  |  LIVE=y |   INIT=y
//!  INIT    |  DEAD   |   empty
//!  (neither INIT)    |   take new
//! ```
//!
//! A same-key merge must keep two invariants. First, a reader cannot
//! distinguish the pre-merge pair from the post-merge single entry: the store
//! returns the newest state either way. Second, an INIT entry's chronological
//! predecessor state is DEAD or nonexistent, which is exactly what makes
//! INIT+DEAD safe to elide to nothing without reviving an older state below,
//! and what makes the two error rows malformations.
//!
//! # Protocol version of a merge
//!
//! The output version is the maximum over both inputs *and* every shadow
//! older than [`FIRST_PROTOCOL_SHADOWS_REMOVED`]. Versions have to be strict
//! here: once any level merges with the INIT-aware algorithm, INIT+DEAD
//! annihilations can occur, and they are only sound if older levels stop
//! eliding lifecycle entries under shadows at the same moment. Lifting the
//! version of every merge that sees a new-protocol record upgrades the whole
//! hierarchy atomically; see [`maybe_put`] for the per-entry half of the
//! argument.

use std::sync::Arc;
use std::time::Instant;

use strata_common::{protocol_version_is_before, protocol_version_starts_from, Hash256};

use crate::bucket::Bucket;
use crate::entry::{check_protocol_legality, compare_entries, BucketEntry, BucketMetadata};
use crate::iterator::{BucketInputIterator, BucketOutputIterator};
use crate::manager::BucketManager;
use crate::metrics::MergeCounters;
use crate::{
    BucketError, Result, FIRST_PROTOCOL_SHADOWS_REMOVED,
    FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
};

/// How many loop iterations pass between shutdown polls.
const SHUTDOWN_POLL_INTERVAL: usize = 1000;

/// Identity of one merge: its inputs and tombstone policy.
///
/// Two merges with equal keys produce byte-identical outputs, so the manager
/// memoizes finished merges by this key and resolves resubmissions without
/// re-running them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub keep_dead_entries: bool,
    pub old: Hash256,
    pub new: Hash256,
    pub shadows: Vec<Hash256>,
}

impl MergeKey {
    /// Build the key identifying a merge of the given buckets.
    pub fn for_inputs(
        keep_dead_entries: bool,
        old_bucket: &Bucket,
        new_bucket: &Bucket,
        shadows: &[Arc<Bucket>],
    ) -> Self {
        Self {
            keep_dead_entries,
            old: old_bucket.hash(),
            new: new_bucket.hash(),
            shadows: shadows.iter().map(|s| s.hash()).collect(),
        }
    }
}

fn count_old_entry(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Meta(_) => mc.old_meta_entries += 1,
        BucketEntry::Init(_) => mc.old_init_entries += 1,
        BucketEntry::Live(_) => mc.old_live_entries += 1,
        BucketEntry::Dead(_) => mc.old_dead_entries += 1,
    }
}

fn count_new_entry(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Meta(_) => mc.new_meta_entries += 1,
        BucketEntry::Init(_) => mc.new_init_entries += 1,
        BucketEntry::Live(_) => mc.new_live_entries += 1,
        BucketEntry::Dead(_) => mc.new_dead_entries += 1,
    }
}

fn count_shadowed_entry(mc: &mut MergeCounters, entry: &BucketEntry) {
    match entry {
        BucketEntry::Meta(_) => mc.meta_entry_shadow_elisions += 1,
        BucketEntry::Init(_) => mc.init_entry_shadow_elisions += 1,
        BucketEntry::Live(_) => mc.live_entry_shadow_elisions += 1,
        BucketEntry::Dead(_) => mc.dead_entry_shadow_elisions += 1,
    }
}

/// Compute the protocol version of a merge and its shadowing mode.
///
/// The version is the max over both inputs and every shadow strictly older
/// than [`FIRST_PROTOCOL_SHADOWS_REMOVED`], so a bucket may still perform an
/// old-style merge despite the presence of new-protocol shadows. Exceeding
/// `max_protocol_version` is fatal, as is supplying shadows to a merge whose
/// computed version has left shadows behind.
fn calculate_merge_protocol_version(
    mc: &mut MergeCounters,
    max_protocol_version: u32,
    oi: &BucketInputIterator,
    ni: &BucketInputIterator,
    shadow_iters: &[BucketInputIterator],
) -> Result<(u32, bool)> {
    let mut protocol_version = oi
        .metadata()
        .ledger_version
        .max(ni.metadata().ledger_version);

    for si in shadow_iters {
        let version = si.metadata().ledger_version;
        if protocol_version_is_before(version, FIRST_PROTOCOL_SHADOWS_REMOVED) {
            protocol_version = protocol_version.max(version);
        }
    }

    tracing::trace!(protocol_version, max_protocol_version, "merge protocol version");

    if protocol_version > max_protocol_version {
        return Err(BucketError::Merge(format!(
            "bucket protocol version {} exceeds maxProtocolVersion {}",
            protocol_version, max_protocol_version
        )));
    }

    // At-or-after protocol 11 shadowing switches to the conservative mode
    // that preserves INIT and DEAD records; see `maybe_put`.
    let keep_shadowed_lifecycle_entries = protocol_version_starts_from(
        protocol_version,
        FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
    );
    if keep_shadowed_lifecycle_entries {
        mc.post_init_entry_protocol_merges += 1;
    } else {
        mc.pre_init_entry_protocol_merges += 1;
    }

    if protocol_version_is_before(protocol_version, FIRST_PROTOCOL_SHADOWS_REMOVED) {
        mc.pre_shadow_removal_protocol_merges += 1;
    } else {
        if !shadow_iters.is_empty() {
            return Err(BucketError::Merge(
                "shadows are not supported at this protocol version".to_string(),
            ));
        }
        mc.post_shadow_removal_protocol_merges += 1;
    }

    Ok((protocol_version, keep_shadowed_lifecycle_entries))
}

/// Write `entry` to the output unless a shadow elides it.
///
/// Before protocol 11 every shadowed entry is dropped here. From protocol 11
/// on, only LIVE entries may be elided; INIT and DEAD pass through
/// unconditionally:
///
/// - DEAD is preserved so that a newer shadow (which may itself be half of
///   an INIT/DEAD pair destined to annihilate) cannot elide the tombstone
///   and leave an older LIVE state ready to be revived.
/// - INIT is preserved so that a DEAD kept by the previous rule eventually
///   ages into, and annihilates with, its own INIT in an older level instead
///   of stranding a redundant tombstone.
///
/// Shadow cursors advance monotonically and are shared across calls within a
/// merge, which is what keeps the whole pass linear.
fn maybe_put(
    out: &mut BucketOutputIterator,
    entry: &BucketEntry,
    shadow_iters: &mut [BucketInputIterator],
    keep_shadowed_lifecycle_entries: bool,
    mc: &mut MergeCounters,
) -> Result<()> {
    if keep_shadowed_lifecycle_entries && (entry.is_init() || entry.is_dead()) {
        // Never shadow-out entries in this case; no point scanning shadows.
        return out.put(entry.clone());
    }

    for si in shadow_iters.iter_mut() {
        // Advance the shadow cursor while it's strictly below the candidate.
        loop {
            let Some(curr) = si.peek() else { break };
            if compare_entries(curr, entry) == std::cmp::Ordering::Less {
                mc.shadow_scan_steps += 1;
                si.advance()?;
            } else {
                break;
            }
        }
        // The cursor now sits at-or-after the candidate; equality means the
        // candidate is shadowed in at least one level.
        if let Some(curr) = si.peek() {
            if compare_entries(curr, entry) == std::cmp::Ordering::Equal {
                count_shadowed_entry(mc, entry);
                return Ok(());
            }
        }
    }

    out.put(entry.clone())
}

/// Handle the easy cases: an exhausted side, or non-equal keys.
///
/// Takes the lesser (or only remaining) entry without inspecting its kind
/// further. Returns false when both sides are live with equal keys, which is
/// the hard case.
fn merge_cases_with_default_acceptance(
    mc: &mut MergeCounters,
    oi: &mut BucketInputIterator,
    ni: &mut BucketInputIterator,
    out: &mut BucketOutputIterator,
    shadow_iters: &mut [BucketInputIterator],
    protocol_version: u32,
    keep_shadowed_lifecycle_entries: bool,
) -> Result<bool> {
    let take_old = match (oi.peek(), ni.peek()) {
        (Some(old), Some(new)) => match compare_entries(old, new) {
            std::cmp::Ordering::Less => Some(true),
            std::cmp::Ordering::Greater => Some(false),
            std::cmp::Ordering::Equal => None,
        },
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
        (None, None) => None,
    };

    match take_old {
        Some(true) => {
            if let Some(entry) = oi.next()? {
                mc.old_entries_default_accepted += 1;
                check_protocol_legality(&entry, protocol_version)?;
                count_old_entry(mc, &entry);
                maybe_put(out, &entry, shadow_iters, keep_shadowed_lifecycle_entries, mc)?;
            }
            Ok(true)
        }
        Some(false) => {
            if let Some(entry) = ni.next()? {
                mc.new_entries_default_accepted += 1;
                check_protocol_legality(&entry, protocol_version)?;
                count_new_entry(mc, &entry);
                maybe_put(out, &entry, shadow_iters, keep_shadowed_lifecycle_entries, mc)?;
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Handle the equal-key case through the lifecycle table.
fn merge_cases_with_equal_keys(
    mc: &mut MergeCounters,
    oi: &mut BucketInputIterator,
    ni: &mut BucketInputIterator,
    out: &mut BucketOutputIterator,
    shadow_iters: &mut [BucketInputIterator],
    protocol_version: u32,
    keep_shadowed_lifecycle_entries: bool,
) -> Result<()> {
    let old_entry = oi
        .next()?
        .ok_or_else(|| BucketError::Invariant("equal-key merge with exhausted old side".to_string()))?;
    let new_entry = ni
        .next()?
        .ok_or_else(|| BucketError::Invariant("equal-key merge with exhausted new side".to_string()))?;

    check_protocol_legality(&old_entry, protocol_version)?;
    check_protocol_legality(&new_entry, protocol_version)?;
    count_old_entry(mc, &old_entry);
    count_new_entry(mc, &new_entry);

    match new_entry {
        BucketEntry::Init(live) => {
            // The only legal new-is-INIT case is merging a delete+create
            // into an update.
            if !old_entry.is_dead() {
                return Err(BucketError::Merge(
                    "malformed bucket: old non-DEAD + new INIT".to_string(),
                ));
            }
            mc.new_init_entries_merged_with_old_dead += 1;
            maybe_put(
                out,
                &BucketEntry::Live(live),
                shadow_iters,
                keep_shadowed_lifecycle_entries,
                mc,
            )
        }
        new_entry if old_entry.is_init() => match new_entry {
            BucketEntry::Live(live) => {
                // Merge a create+update into a fresher create.
                mc.old_init_entries_merged_with_new_live += 1;
                maybe_put(
                    out,
                    &BucketEntry::Init(live),
                    shadow_iters,
                    keep_shadowed_lifecycle_entries,
                    mc,
                )
            }
            BucketEntry::Dead(_) => {
                // Merge a create+delete into nothingness.
                mc.old_init_entries_merged_with_new_dead += 1;
                Ok(())
            }
            other => Err(BucketError::Invariant(format!(
                "unexpected {} record in equal-key merge",
                other.kind_name()
            ))),
        },
        new_entry => {
            // Neither side is INIT: take the newer one.
            mc.new_entries_merged_with_old_neither_init += 1;
            maybe_put(
                out,
                &new_entry,
                shadow_iters,
                keep_shadowed_lifecycle_entries,
                mc,
            )
        }
    }
}

impl Bucket {
    /// Merge two buckets under a shadow set into a new bucket.
    ///
    /// `new_bucket` holds the newer state; where keys collide its entries
    /// win subject to the lifecycle table. The output's protocol version is
    /// computed from the inputs and shadows and must not exceed
    /// `max_protocol_version`.
    ///
    /// The manager is polled for shutdown roughly every thousand records;
    /// an aborted merge leaves only an unadopted temp file behind. Identical
    /// resubmitted merges resolve from the manager's memo without re-running.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        manager: &BucketManager,
        max_protocol_version: u32,
        old_bucket: &Arc<Bucket>,
        new_bucket: &Arc<Bucket>,
        shadows: &[Arc<Bucket>],
        keep_dead_entries: bool,
        count_merge_events: bool,
        do_fsync: bool,
    ) -> Result<Arc<Bucket>> {
        let merge_key = MergeKey::for_inputs(keep_dead_entries, old_bucket, new_bucket, shadows);
        if let Some(existing) = manager.get_merge_result(&merge_key) {
            tracing::debug!(
                old = %merge_key.old,
                new = %merge_key.new,
                output = %existing.hash(),
                "reattached to completed merge"
            );
            if count_merge_events {
                let reattach = MergeCounters {
                    running_merge_reattachments: 1,
                    ..Default::default()
                };
                manager.incr_merge_counters(&reattach);
            }
            return Ok(existing);
        }

        let started = Instant::now();
        let mut mc = MergeCounters::default();

        let mut oi = BucketInputIterator::open(old_bucket)?;
        let mut ni = BucketInputIterator::open(new_bucket)?;
        let mut shadow_iters = shadows
            .iter()
            .map(|shadow| BucketInputIterator::open(shadow))
            .collect::<Result<Vec<_>>>()?;

        let (protocol_version, keep_shadowed_lifecycle_entries) = calculate_merge_protocol_version(
            &mut mc,
            max_protocol_version,
            &oi,
            &ni,
            &shadow_iters,
        )?;

        tracing::trace!(
            old = %old_bucket.hash(),
            new = %new_bucket.hash(),
            shadows = shadows.len(),
            protocol_version,
            keep_dead_entries,
            "bucket merge starting"
        );

        let meta = BucketMetadata {
            ledger_version: protocol_version,
        };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), keep_dead_entries, meta, do_fsync)?;

        let mut since_poll = 0usize;
        while oi.has_next() || ni.has_next() {
            since_poll += 1;
            if since_poll >= SHUTDOWN_POLL_INTERVAL {
                since_poll = 0;
                if manager.is_shutdown() {
                    // The temp file has not been adopted yet; it goes away
                    // with the manager's temp dir.
                    return Err(BucketError::Shutdown);
                }
            }

            if !merge_cases_with_default_acceptance(
                &mut mc,
                &mut oi,
                &mut ni,
                &mut out,
                &mut shadow_iters,
                protocol_version,
                keep_shadowed_lifecycle_entries,
            )? {
                merge_cases_with_equal_keys(
                    &mut mc,
                    &mut oi,
                    &mut ni,
                    &mut out,
                    &mut shadow_iters,
                    protocol_version,
                    keep_shadowed_lifecycle_entries,
                )?;
            }
        }

        if count_merge_events {
            manager.incr_merge_counters(&mc);
        }
        manager.merge_timer().record(started.elapsed());

        let result = out.get_bucket(manager, manager.config().use_index, Some(merge_key))?;
        tracing::trace!(result = %result.hash(), "bucket merge complete");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountEntry, AccountId, LedgerEntry, LedgerEntryData, LedgerKey};
    use crate::BucketManagerConfig;
    use std::path::Path;

    fn make_account_entry(byte: u8, balance: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Account(AccountEntry {
                account_id: AccountId([byte; 32]),
                balance,
                seq_num: 1,
            }),
        }
    }

    fn make_account_key(byte: u8) -> LedgerKey {
        LedgerKey::Account {
            account_id: AccountId([byte; 32]),
        }
    }

    fn test_manager(dir: &Path) -> BucketManager {
        BucketManager::with_config(dir.to_path_buf(), BucketManagerConfig::default()).unwrap()
    }

    fn bucket_from(
        manager: &BucketManager,
        protocol: u32,
        entries: Vec<BucketEntry>,
    ) -> Arc<Bucket> {
        let meta = BucketMetadata {
            ledger_version: protocol,
        };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        for entry in entries {
            out.put(entry).unwrap();
        }
        out.get_bucket(manager, false, None).unwrap()
    }

    fn collect(bucket: &Bucket) -> Vec<BucketEntry> {
        let mut iter = BucketInputIterator::open(bucket).unwrap();
        let mut out = Vec::new();
        while let Some(entry) = iter.next().unwrap() {
            out.push(entry);
        }
        out
    }

    #[test]
    fn test_merge_take_newer() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(
            &manager,
            11,
            vec![
                BucketEntry::Live(make_account_entry(1, 1)),
                BucketEntry::Live(make_account_entry(2, 1)),
            ],
        );
        let new = bucket_from(
            &manager,
            11,
            vec![
                BucketEntry::Live(make_account_entry(2, 2)),
                BucketEntry::Live(make_account_entry(3, 2)),
            ],
        );

        let merged = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        let entries = collect(&merged);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key().unwrap(), make_account_key(1));
        match &entries[1] {
            BucketEntry::Live(le) => match &le.data {
                LedgerEntryData::Account(acc) => assert_eq!(acc.balance, 2),
                _ => panic!("expected account"),
            },
            _ => panic!("expected live"),
        }
        assert_eq!(entries[2].key().unwrap(), make_account_key(3));
    }

    #[test]
    fn test_init_plus_dead_annihilates() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 11, vec![BucketEntry::Init(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Dead(make_account_key(1))]);

        let merged = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        assert!(collect(&merged).is_empty());

        let mc = manager.merge_counters();
        assert_eq!(mc.old_init_entries_merged_with_new_dead, 1);
    }

    #[test]
    fn test_dead_plus_init_becomes_live() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 11, vec![BucketEntry::Dead(make_account_key(1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Init(make_account_entry(1, 5))]);

        let merged = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        let entries = collect(&merged);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_live());
        match &entries[0] {
            BucketEntry::Live(le) => match &le.data {
                LedgerEntryData::Account(acc) => assert_eq!(acc.balance, 5),
                _ => panic!("expected account"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_init_plus_live_stays_init() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 11, vec![BucketEntry::Init(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Live(make_account_entry(1, 9))]);

        let merged = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        let entries = collect(&merged);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_init());
        match &entries[0] {
            BucketEntry::Init(le) => match &le.data {
                LedgerEntryData::Account(acc) => assert_eq!(acc.balance, 9),
                _ => panic!("expected account"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_equal_key_malformations_are_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        // INIT old + INIT new.
        let old = bucket_from(&manager, 11, vec![BucketEntry::Init(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Init(make_account_entry(1, 2))]);
        let err = Bucket::merge(&manager, 11, &old, &new, &[], true, false, false);
        assert!(matches!(err, Err(BucketError::Merge(_))));

        // LIVE old + INIT new.
        let old = bucket_from(&manager, 11, vec![BucketEntry::Live(make_account_entry(2, 1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Init(make_account_entry(2, 2))]);
        let err = Bucket::merge(&manager, 11, &old, &new, &[], true, false, false);
        assert!(matches!(err, Err(BucketError::Merge(_))));
    }

    #[test]
    fn test_live_plus_dead_takes_dead() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 11, vec![BucketEntry::Live(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Dead(make_account_key(1))]);

        let merged = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        let entries = collect(&merged);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dead());

        // With keep_dead_entries = false the tombstone is filtered.
        let merged = Bucket::merge(&manager, 11, &old, &new, &[], false, true, false).unwrap();
        assert!(collect(&merged).is_empty());
    }

    #[test]
    fn test_protocol_ceiling_exceeded() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 12, vec![BucketEntry::Live(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 12, vec![BucketEntry::Live(make_account_entry(2, 1))]);

        let err = Bucket::merge(&manager, 11, &old, &new, &[], true, false, false);
        assert!(matches!(err, Err(BucketError::Merge(_))));
    }

    #[test]
    fn test_shadows_rejected_after_removal_protocol() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 12, vec![BucketEntry::Live(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 12, vec![BucketEntry::Live(make_account_entry(2, 1))]);
        let shadow = bucket_from(&manager, 12, vec![BucketEntry::Live(make_account_entry(1, 9))]);

        let err = Bucket::merge(
            &manager,
            12,
            &old,
            &new,
            &[shadow],
            true,
            false,
            false,
        );
        assert!(matches!(err, Err(BucketError::Merge(_))));
    }

    #[test]
    fn test_old_protocol_shadow_elides_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        // Protocol 10: shadowed entries are dropped regardless of kind.
        let old = bucket_from(
            &manager,
            10,
            vec![
                BucketEntry::Live(make_account_entry(1, 1)),
                BucketEntry::Dead(make_account_key(2)),
            ],
        );
        let new = bucket_from(&manager, 10, vec![]);
        let shadow = bucket_from(
            &manager,
            10,
            vec![
                BucketEntry::Live(make_account_entry(1, 9)),
                BucketEntry::Live(make_account_entry(2, 9)),
            ],
        );

        let merged =
            Bucket::merge(&manager, 10, &old, &new, &[shadow], true, true, false).unwrap();
        assert!(merged.is_empty());

        let mc = manager.merge_counters();
        assert_eq!(mc.live_entry_shadow_elisions, 1);
        assert_eq!(mc.dead_entry_shadow_elisions, 1);
        assert_eq!(mc.pre_init_entry_protocol_merges, 1);
    }

    #[test]
    fn test_new_protocol_shadow_preserves_lifecycle_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        // Protocol 11: DEAD and INIT survive shadows, LIVE does not.
        let old = bucket_from(
            &manager,
            11,
            vec![
                BucketEntry::Dead(make_account_key(1)),
                BucketEntry::Init(make_account_entry(2, 2)),
                BucketEntry::Live(make_account_entry(3, 3)),
            ],
        );
        let new = bucket_from(&manager, 11, vec![]);
        let shadow = bucket_from(
            &manager,
            11,
            vec![
                BucketEntry::Live(make_account_entry(1, 9)),
                BucketEntry::Live(make_account_entry(2, 9)),
                BucketEntry::Live(make_account_entry(3, 9)),
            ],
        );

        let merged =
            Bucket::merge(&manager, 11, &old, &new, &[shadow], true, true, false).unwrap();
        let entries = collect(&merged);
        let kinds: Vec<_> = entries.iter().map(|e| e.kind_name()).collect();
        assert_eq!(kinds, vec!["DEAD", "INIT"]);

        let mc = manager.merge_counters();
        assert_eq!(mc.live_entry_shadow_elisions, 1);
        assert_eq!(mc.init_entry_shadow_elisions, 0);
        assert_eq!(mc.dead_entry_shadow_elisions, 0);
    }

    #[test]
    fn test_shadow_version_lifts_merge_protocol() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        // Both inputs pre-11, shadow at 11 (< shadow-removal protocol): the
        // merge computes protocol 11 and preserves the DEAD under shadow.
        let old = bucket_from(&manager, 10, vec![BucketEntry::Dead(make_account_key(1))]);
        let new = bucket_from(&manager, 10, vec![]);
        let shadow = bucket_from(&manager, 11, vec![BucketEntry::Live(make_account_entry(1, 9))]);

        let merged =
            Bucket::merge(&manager, 11, &old, &new, &[shadow], true, true, false).unwrap();
        assert_eq!(merged.version().unwrap(), 11);
        let entries = collect(&merged);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_dead());
    }

    #[test]
    fn test_merge_idempotent_against_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let entries = vec![
            BucketEntry::Live(make_account_entry(1, 1)),
            BucketEntry::Dead(make_account_key(2)),
        ];
        let bucket = bucket_from(&manager, 11, entries.clone());
        let empty = Arc::new(Bucket::empty());

        let a = Bucket::merge(&manager, 11, &bucket, &empty, &[], true, false, false).unwrap();
        let b = Bucket::merge(&manager, 11, &empty, &bucket, &[], true, false, false).unwrap();
        assert_eq!(collect(&a), entries);
        assert_eq!(collect(&b), entries);
        // Same contents, same canonical hash.
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_merge_memoization() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        let old = bucket_from(&manager, 11, vec![BucketEntry::Live(make_account_entry(1, 1))]);
        let new = bucket_from(&manager, 11, vec![BucketEntry::Live(make_account_entry(2, 2))]);

        let first = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        let second = Bucket::merge(&manager, 11, &old, &new, &[], true, true, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mc = manager.merge_counters();
        assert_eq!(mc.running_merge_reattachments, 1);
    }

    #[test]
    fn test_shutdown_aborts_merge() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = test_manager(tmp.path());

        // Enough entries to reach the shutdown poll interval.
        let old_entries: Vec<BucketEntry> = (0..=255u8)
            .flat_map(|hi| {
                (0..4u8).map(move |lo| {
                    let mut id = [0u8; 32];
                    id[0] = hi;
                    id[1] = lo;
                    BucketEntry::Live(LedgerEntry {
                        last_modified_ledger_seq: 1,
                        data: LedgerEntryData::Account(AccountEntry {
                            account_id: AccountId(id),
                            balance: 1,
                            seq_num: 1,
                        }),
                    })
                })
            })
            .collect();
        let old = bucket_from(&manager, 11, old_entries);
        let new = bucket_from(&manager, 11, vec![]);

        manager.shutdown();
        let err = Bucket::merge(&manager, 11, &old, &new, &[], true, false, false);
        assert!(matches!(err, Err(BucketError::Shutdown)));
        assert_eq!(
            err.unwrap_err().to_string(),
            "Incomplete bucket merge due to BucketManager shutdown"
        );
    }
}
