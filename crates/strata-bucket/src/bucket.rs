//! The bucket handle.
//!
//! A [`Bucket`] is an immutable value: a published file, the SHA-256 of its
//! exact bytes, the file size, and an optionally attached index. Handles are
//! shared (`Arc`) between the manager's registry and whatever holds them; the
//! file outlives every holder because the manager names it by hash and never
//! rewrites it.
//!
//! The distinguished *empty bucket* has an empty filename and the zero hash;
//! both conditions hold together or the handle is malformed.
//!
//! # Cached Streams
//!
//! Point lookups and eviction scans reuse cached read streams (one each) so
//! repeated reads don't reopen the file. The streams are interior-mutable
//! behind mutexes; the rest of the handle never changes after publication,
//! so buckets are freely shareable across threads.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use strata_common::{protocol_version_starts_from, Hash256};

use crate::entry::{compare_entries, BucketEntry, BucketMetadata};
use crate::index::BucketIndex;
use crate::iterator::{BucketInputIterator, BucketOutputIterator, RecordStream};
use crate::manager::BucketManager;
use crate::model::{
    entry_key, is_pool_share_trustline, is_pool_share_trustline_key, pool_key_for_trustline,
    AccountId, LedgerEntry, LedgerKey,
};
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// An immutable bucket: published file, content hash, size, optional index.
pub struct Bucket {
    filename: PathBuf,
    hash: Hash256,
    size: u64,
    index: RwLock<Option<Arc<BucketIndex>>>,
    index_stream: Mutex<Option<RecordStream>>,
    eviction_stream: Mutex<Option<RecordStream>>,
}

impl Bucket {
    /// The distinguished empty bucket: no file, zero hash.
    pub fn empty() -> Self {
        Self {
            filename: PathBuf::new(),
            hash: Hash256::ZERO,
            size: 0,
            index: RwLock::new(None),
            index_stream: Mutex::new(None),
            eviction_stream: Mutex::new(None),
        }
    }

    /// Wrap a published bucket file.
    ///
    /// The file must exist; a handle is only ever constructed over bytes
    /// already on disk.
    pub fn new(filename: PathBuf, hash: Hash256) -> Result<Self> {
        let size = std::fs::metadata(&filename)
            .map_err(|e| BucketError::NotFound(format!("{}: {}", filename.display(), e)))?
            .len();
        tracing::trace!(file = %filename.display(), %hash, size, "bucket handle created");
        Ok(Self {
            filename,
            hash,
            size,
            index: RwLock::new(None),
            index_stream: Mutex::new(None),
            eviction_stream: Mutex::new(None),
        })
    }

    /// Content hash of the bucket file.
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    /// Path of the published file (empty for the empty bucket).
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether this is the empty bucket.
    ///
    /// Empty filename and zero hash must agree; disagreement means the
    /// handle was constructed from inconsistent state.
    pub fn is_empty(&self) -> bool {
        if self.filename.as_os_str().is_empty() || self.hash.is_zero() {
            assert!(
                self.filename.as_os_str().is_empty() && self.hash.is_zero(),
                "half-empty bucket handle"
            );
            return true;
        }
        false
    }

    /// Protocol version recorded in the bucket's leading META record.
    ///
    /// Zero for pre-META buckets and the empty bucket.
    pub fn version(&self) -> Result<u32> {
        let iter = BucketInputIterator::open(self)?;
        Ok(iter.metadata().ledger_version)
    }

    // ========================================================================
    // Index attachment
    // ========================================================================

    /// Whether an index is currently attached.
    pub fn is_indexed(&self) -> bool {
        self.index.read().is_some()
    }

    /// The attached index.
    pub fn index(&self) -> Result<Arc<BucketIndex>> {
        self.index
            .read()
            .clone()
            .ok_or_else(|| BucketError::Invariant("bucket is not indexed".to_string()))
    }

    /// Attach an index. Attaching over an existing index is a bug.
    pub fn set_index(&self, index: BucketIndex) -> Result<()> {
        let mut guard = self.index.write();
        if guard.is_some() {
            return Err(BucketError::Invariant(
                "bucket index already attached".to_string(),
            ));
        }
        *guard = Some(Arc::new(index));
        Ok(())
    }

    /// Drop the attached index and the cached index stream.
    ///
    /// The index can be rebuilt and re-attached later without changing the
    /// bucket's identity.
    pub fn free_index(&self) {
        *self.index.write() = None;
        *self.index_stream.lock() = None;
    }

    // ========================================================================
    // Cached streams
    // ========================================================================

    fn with_index_stream<T>(&self, f: impl FnOnce(&mut RecordStream) -> Result<T>) -> Result<T> {
        let mut guard = self.index_stream.lock();
        if guard.is_none() {
            *guard = Some(RecordStream::open(&self.filename)?);
        }
        f(guard.as_mut().expect("stream populated above"))
    }

    pub(crate) fn with_eviction_stream<T>(
        &self,
        f: impl FnOnce(&mut RecordStream) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.eviction_stream.lock();
        if guard.is_none() {
            *guard = Some(RecordStream::open(&self.filename)?);
        }
        f(guard.as_mut().expect("stream populated above"))
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Read the record for `key` at `pos`.
    ///
    /// With a zero page size the offset addresses the record directly. With
    /// a non-zero page size the page at `pos` is scanned for a key-equal
    /// record; coming up empty is a bloom false positive and is recorded on
    /// the index.
    fn get_entry_at_offset(
        &self,
        key: &LedgerKey,
        pos: u64,
        page_size: u64,
    ) -> Result<Option<BucketEntry>> {
        let found = self.with_index_stream(|stream| {
            stream.seek(pos)?;
            if page_size == 0 {
                stream.read_one()
            } else {
                stream.read_page(key, page_size)
            }
        })?;

        match found {
            Some(entry) => Ok(Some(entry)),
            None => {
                self.index()?.mark_bloom_miss();
                Ok(None)
            }
        }
    }

    /// Point lookup through the index.
    pub fn get_bucket_entry(&self, key: &LedgerKey) -> Result<Option<BucketEntry>> {
        if self.is_empty() {
            return Ok(None);
        }
        let index = self.index()?;
        match index.lookup(key) {
            Some(pos) => self.get_entry_at_offset(key, pos, index.page_size()),
            None => Ok(None),
        }
    }

    /// Batch lookup: load every wanted key present in this bucket.
    ///
    /// Walks the sorted wanted set and the index cursor in tandem, so the
    /// whole batch is one linear traversal. Keys found here, live or dead,
    /// are removed from `keys` so older buckets are not consulted for them;
    /// only live payloads are appended to `result`. Keys not found stay in
    /// `keys` for older buckets.
    pub fn load_keys(
        &self,
        keys: &mut BTreeSet<LedgerKey>,
        result: &mut Vec<LedgerEntry>,
    ) -> Result<()> {
        if self.is_empty() || keys.is_empty() {
            return Ok(());
        }
        let index = self.index()?;
        let page_size = index.page_size();
        let end = index.end();

        let mut cursor = index.begin();
        let mut found_keys = Vec::new();
        for key in keys.iter() {
            if cursor >= end {
                break;
            }
            let (offset, next) = index.scan(cursor, key);
            cursor = next;
            let Some(offset) = offset else { continue };
            if let Some(entry) = self.get_entry_at_offset(key, offset, page_size)? {
                if !entry.is_dead() {
                    if let Some(live) = entry.as_ledger_entry() {
                        result.push(live.clone());
                    }
                }
                found_keys.push(key.clone());
            }
        }

        for key in &found_keys {
            keys.remove(key);
        }
        Ok(())
    }

    /// Collect the pool-share trustlines owned by `account_id`.
    ///
    /// Reads the index's trustline byte range sequentially. DEAD trustlines
    /// enter `seen` so older buckets cannot resurrect them; the newest live
    /// version of each trustline lands in `pool_key_to_trustline` under its
    /// derived liquidity-pool key, which is also added to `pool_keys`.
    pub fn load_pool_share_trustlines_by_account(
        &self,
        account_id: &AccountId,
        seen: &mut HashSet<LedgerKey>,
        pool_key_to_trustline: &mut HashMap<LedgerKey, LedgerEntry>,
        pool_keys: &mut BTreeSet<LedgerKey>,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let Some((lo, hi)) = self.index()?.pool_share_trustline_range(account_id) else {
            return Ok(());
        };

        self.with_index_stream(|stream| {
            stream.seek(lo)?;
            while stream.pos() < hi {
                let Some(be) = stream.read_one()? else { break };
                let entry = match be {
                    BucketEntry::Live(entry) | BucketEntry::Init(entry) => entry,
                    BucketEntry::Dead(key) => {
                        if is_pool_share_trustline_key(&key, account_id) {
                            seen.insert(key);
                        }
                        continue;
                    }
                    BucketEntry::Meta(_) => {
                        return Err(BucketError::MalformedBucket(
                            "META record mid-stream".to_string(),
                        ));
                    }
                };

                if is_pool_share_trustline(&entry, account_id) {
                    let key = entry_key(&entry);
                    if seen.insert(key) {
                        if let Some(pool_key) = pool_key_for_trustline(&entry) {
                            pool_key_to_trustline.insert(pool_key.clone(), entry);
                            pool_keys.insert(pool_key);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Linear scan: does some record share `entry`'s ledger key?
    pub fn contains_bucket_identity(&self, entry: &BucketEntry) -> Result<bool> {
        let mut iter = BucketInputIterator::open(self)?;
        while let Some(candidate) = iter.next()? {
            if compare_entries(&candidate, entry) == std::cmp::Ordering::Equal {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ========================================================================
    // Fresh construction
    // ========================================================================

    /// Build a fresh bucket from one batch of ledger changes.
    ///
    /// Before protocol 11 the created entries collapse to LIVE for
    /// compatibility; from protocol 11 on they are written as INIT. The
    /// combined batch must not contain two entries for the same key.
    pub fn fresh(
        manager: &BucketManager,
        protocol_version: u32,
        init_entries: Vec<LedgerEntry>,
        live_entries: Vec<LedgerEntry>,
        dead_entries: Vec<LedgerKey>,
        do_fsync: bool,
    ) -> Result<Arc<Bucket>> {
        let use_init = protocol_version_starts_from(
            protocol_version,
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
        );
        let entries =
            convert_to_bucket_entries(use_init, init_entries, live_entries, dead_entries)?;

        let meta = BucketMetadata {
            ledger_version: protocol_version,
        };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, do_fsync)?;
        for entry in entries {
            out.put(entry)?;
        }
        out.get_bucket(manager, manager.config().use_index, None)
    }
}

/// Tag, combine, and sort one batch of ledger changes into bucket entries.
///
/// The result is strictly sorted; two entries for the same key in one batch
/// mean the caller's change set is malformed.
fn convert_to_bucket_entries(
    use_init: bool,
    init_entries: Vec<LedgerEntry>,
    live_entries: Vec<LedgerEntry>,
    dead_entries: Vec<LedgerKey>,
) -> Result<Vec<BucketEntry>> {
    let mut entries: Vec<BucketEntry> =
        Vec::with_capacity(init_entries.len() + live_entries.len() + dead_entries.len());

    for entry in init_entries {
        entries.push(if use_init {
            BucketEntry::Init(entry)
        } else {
            BucketEntry::Live(entry)
        });
    }
    for entry in live_entries {
        entries.push(BucketEntry::Live(entry));
    }
    for key in dead_entries {
        entries.push(BucketEntry::Dead(key));
    }

    entries.sort_by(compare_entries);
    for pair in entries.windows(2) {
        if compare_entries(&pair[0], &pair[1]) == std::cmp::Ordering::Equal {
            return Err(BucketError::MalformedBucket(
                "fresh bucket batch contains duplicate keys".to_string(),
            ));
        }
    }
    Ok(entries)
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("filename", &self.filename)
            .field("hash", &self.hash)
            .field("size", &self.size)
            .field("indexed", &self.is_indexed())
            .finish()
    }
}
