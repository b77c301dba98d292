//! Incremental eviction scan.
//!
//! Temporary contract state carries a TTL; once the current ledger passes an
//! entry's `live_until_ledger_seq` the entry is expired and must be deleted.
//! A full sweep per ledger would be far too expensive, so the scan is
//! incremental: each invocation reads forward from a persisted byte offset,
//! charges every record against a byte budget, and deletes expired temporary
//! entries through the caller's ledger transaction until a budget runs out or
//! the bucket ends.
//!
//! The caller owns all of the scan state: the [`EvictionIterator`] offset,
//! the byte and entry budgets, and the monitoring counters. Resuming is just
//! calling again with the same iterator; the interleaving of calls does not
//! change which entries get evicted.
//!
//! The scan uses the bucket's dedicated eviction stream, a separate cached
//! handle from the index stream, so lookups and scans never fight over one
//! seek position.

use std::sync::atomic::Ordering;

use strata_common::protocol_version_is_before;

use crate::bucket::Bucket;
use crate::metrics::{EvictionCounters, EvictionMetrics};
use crate::model::{entry_key, is_live, is_temporary_entry, ttl_key, ttl_live_until, LedgerEntry, LedgerKey};
use crate::{BucketError, Result, SOROBAN_PROTOCOL_VERSION};

/// Ledger transaction surface consumed by the eviction scan.
///
/// `load_without_record` reads current ledger state without creating a
/// change-tracking record; `erase` deletes an entry. The implementation is
/// expected to serialize its own mutations.
pub trait LedgerTxn {
    fn load_without_record(&self, key: &LedgerKey) -> Option<LedgerEntry>;
    fn erase(&mut self, key: &LedgerKey);
}

/// Persistent position of the eviction scan within one bucket file.
///
/// The offset always sits on a record boundary: it is only ever advanced to
/// the stream position after a whole record has been consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionIterator {
    /// Byte offset to resume reading from.
    pub bucket_file_offset: u32,
}

impl Bucket {
    /// Scan forward for expired temporary entries, deleting them via `ltx`.
    ///
    /// Returns `false` when this bucket is exhausted (EOF, empty, or written
    /// before [`SOROBAN_PROTOCOL_VERSION`]) and the caller should move to the
    /// next bucket; `true` when a budget ran out mid-bucket and the next call
    /// should resume from `iter`.
    ///
    /// Every record, evictable or not, consumes byte budget. For each
    /// LIVE or INIT record holding a temporary entry, current state is
    /// consulted through `ltx`: an already-deleted entry is skipped (its TTL
    /// entry must be gone too), and an entry whose TTL has lapsed at
    /// `ledger_seq` is erased together with its TTL entry.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_for_eviction(
        &self,
        ltx: &mut dyn LedgerTxn,
        iter: &mut EvictionIterator,
        bytes_to_scan: &mut u32,
        remaining_entries_to_evict: &mut u32,
        ledger_seq: u32,
        counters: &EvictionCounters,
        mut metrics: Option<&mut EvictionMetrics>,
    ) -> Result<bool> {
        if self.is_empty()
            || protocol_version_is_before(self.version()?, SOROBAN_PROTOCOL_VERSION)
        {
            // EOF equivalent: nothing here to scan, move to the next bucket.
            return Ok(false);
        }

        if *remaining_entries_to_evict == 0 || *bytes_to_scan == 0 {
            return Ok(true);
        }

        self.with_eviction_stream(|stream| {
            stream.seek(u64::from(iter.bucket_file_offset))?;

            while let Some(be) = stream.read_one()? {
                if let Some(le) = be.as_ledger_entry() {
                    if is_temporary_entry(le) {
                        let key = entry_key(le);
                        let ttl = ttl_key(&key);

                        let mut live_until = 0u32;
                        let should_evict = match ltx.load_without_record(&key) {
                            None => {
                                // Deleted manually or by an earlier scan; the
                                // TTL entry must have gone with it.
                                if ltx.load_without_record(&ttl).is_some() {
                                    return Err(BucketError::Invariant(
                                        "TTL entry outlives its primary entry".to_string(),
                                    ));
                                }
                                false
                            }
                            Some(_) => {
                                let ttl_entry =
                                    ltx.load_without_record(&ttl).ok_or_else(|| {
                                        BucketError::Invariant(
                                            "temporary entry has no TTL entry".to_string(),
                                        )
                                    })?;
                                live_until = ttl_live_until(&ttl_entry).ok_or_else(|| {
                                    BucketError::Invariant(
                                        "TTL key resolved to a non-TTL entry".to_string(),
                                    )
                                })?;
                                !is_live(&ttl_entry, ledger_seq)
                            }
                        };

                        if should_evict {
                            if let Some(m) = metrics.as_deref_mut() {
                                m.num_entries_evicted += 1;
                                m.evicted_entries_age_sum += (ledger_seq - live_until) as u64;
                            }
                            ltx.erase(&ttl);
                            ltx.erase(&key);
                            counters.entries_evicted.fetch_add(1, Ordering::Relaxed);
                            *remaining_entries_to_evict -= 1;
                        }
                    }
                }

                let new_pos = stream.pos();
                let bytes_read = (new_pos - u64::from(iter.bucket_file_offset)) as u32;
                iter.bucket_file_offset = new_pos as u32;
                counters
                    .bytes_scanned_for_eviction
                    .fetch_add(bytes_read as u64, Ordering::Relaxed);

                if bytes_read >= *bytes_to_scan {
                    *bytes_to_scan = 0;
                    return Ok(true);
                } else if *remaining_entries_to_evict == 0 {
                    return Ok(true);
                }
                *bytes_to_scan -= bytes_read;
            }

            // Hit EOF.
            Ok(false)
        })
    }
}
