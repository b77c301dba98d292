//! Bucket manager: adoption, deduplication, and shared merge state.
//!
//! The manager owns everything a single bucket does not: the directory
//! published buckets live in, the temp directory unfinished output files are
//! written to, the registry of live handles keyed by content hash, the
//! aggregate merge counters and timer, the shutdown flag merges poll, and the
//! memo of completed merges.
//!
//! # Adoption
//!
//! [`BucketOutputIterator::get_bucket`](crate::BucketOutputIterator::get_bucket)
//! is the commit point of every build: the finished temp file is handed here
//! and either renamed under its canonical hash-derived name or, when a
//! bucket with the same hash is already registered, discarded in favor of
//! the existing handle. Files are write-once; the rename is the only move
//! they ever make.
//!
//! # Temp directory
//!
//! Temp files use random names chosen by rejection sampling against existing
//! files. An aborted build orphans its temp file; the whole temp directory is
//! reaped when the manager is dropped, so orphans never outlive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use strata_common::Hash256;

use crate::bucket::Bucket;
use crate::index::BucketIndex;
use crate::merge::MergeKey;
use crate::metrics::{MergeCounters, MergeTimer};
use crate::Result;

/// Generate an unused random file name under `dir`.
///
/// Eight random bytes, hex-encoded, rejection-sampled against names already
/// present.
pub(crate) fn random_file_name(dir: &Path, ext: &str) -> PathBuf {
    loop {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let candidate = dir.join(format!("tmp-bucket-{}{}", hex::encode(bytes), ext));
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// Random temp name for a bucket file.
pub(crate) fn random_bucket_name(dir: &Path) -> PathBuf {
    random_file_name(dir, ".xdr")
}

/// Random temp name for an index file.
pub(crate) fn random_index_name(dir: &Path) -> PathBuf {
    random_file_name(dir, ".index")
}

/// Manager configuration.
#[derive(Debug, Clone, Copy)]
pub struct BucketManagerConfig {
    /// Build and attach an index when adopting a bucket.
    pub use_index: bool,
    /// Persist indexes next to their bucket files and reload them on adopt.
    pub persist_index: bool,
}

impl Default for BucketManagerConfig {
    fn default() -> Self {
        Self {
            use_index: true,
            persist_index: false,
        }
    }
}

/// Memo of completed merges, keyed by [`MergeKey`].
///
/// Since equal merge keys yield byte-identical outputs, a resubmitted merge
/// can be resolved from here instead of rerun.
#[derive(Debug, Default)]
pub struct BucketMergeMap {
    merge_key_to_output: HashMap<MergeKey, Hash256>,
}

impl BucketMergeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed merge and the hash it produced.
    pub fn record_merge(&mut self, merge_key: MergeKey, output: Hash256) {
        self.merge_key_to_output.insert(merge_key, output);
    }

    /// Output hash of a previously completed merge.
    pub fn get_output(&self, merge_key: &MergeKey) -> Option<Hash256> {
        self.merge_key_to_output.get(merge_key).copied()
    }

    /// Drop the record of a merge whose output is no longer wanted.
    pub fn forget_merge(&mut self, merge_key: &MergeKey) {
        self.merge_key_to_output.remove(merge_key);
    }

    /// Number of recorded merges.
    pub fn len(&self) -> usize {
        self.merge_key_to_output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merge_key_to_output.is_empty()
    }
}

/// Owner of published buckets and shared merge state.
pub struct BucketManager {
    bucket_dir: PathBuf,
    tmp_dir: PathBuf,
    config: BucketManagerConfig,
    registry: RwLock<HashMap<Hash256, Arc<Bucket>>>,
    merge_map: Mutex<BucketMergeMap>,
    merge_counters: Mutex<MergeCounters>,
    merge_timer: MergeTimer,
    shutdown: AtomicBool,
}

impl BucketManager {
    /// Create a manager rooted at `bucket_dir` with default configuration.
    pub fn new(bucket_dir: PathBuf) -> Result<Self> {
        Self::with_config(bucket_dir, BucketManagerConfig::default())
    }

    /// Create a manager rooted at `bucket_dir`.
    ///
    /// Creates the directory and its `tmp/` subdirectory if missing.
    pub fn with_config(bucket_dir: PathBuf, config: BucketManagerConfig) -> Result<Self> {
        std::fs::create_dir_all(&bucket_dir)?;
        let tmp_dir = bucket_dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            bucket_dir,
            tmp_dir,
            config,
            registry: RwLock::new(HashMap::new()),
            merge_map: Mutex::new(BucketMergeMap::new()),
            merge_counters: Mutex::new(MergeCounters::default()),
            merge_timer: MergeTimer::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Directory published buckets live in.
    pub fn bucket_dir(&self) -> &Path {
        &self.bucket_dir
    }

    /// Directory unfinished output files are written to.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Manager configuration.
    pub fn config(&self) -> &BucketManagerConfig {
        &self.config
    }

    /// Canonical path for a bucket with the given hash.
    pub fn bucket_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(format!("bucket-{}.xdr", hash.to_hex()))
    }

    /// Canonical path for a bucket's persisted index.
    pub fn index_path(&self, hash: &Hash256) -> PathBuf {
        self.bucket_dir.join(format!("bucket-{}.index", hash.to_hex()))
    }

    // ========================================================================
    // Adoption
    // ========================================================================

    /// Adopt a finished output file under its canonical name.
    ///
    /// If a bucket with `hash` is already registered, the temp file is
    /// discarded and the existing handle returned; otherwise the file is
    /// renamed into place and (when requested) indexed. `merge_key` records
    /// the merge that produced this output for later deduplication.
    pub fn adopt_bucket_file(
        &self,
        temp_path: &Path,
        hash: Hash256,
        use_index: bool,
        merge_key: Option<MergeKey>,
    ) -> Result<Arc<Bucket>> {
        let mut registry = self.registry.write();

        if let Some(existing) = registry.get(&hash) {
            tracing::trace!(%hash, "duplicate bucket contents, discarding temp file");
            std::fs::remove_file(temp_path)?;
            if let Some(key) = merge_key {
                self.merge_map.lock().record_merge(key, hash);
            }
            return Ok(existing.clone());
        }

        let canonical = self.bucket_path(&hash);
        std::fs::rename(temp_path, &canonical)?;
        let bucket = Bucket::new(canonical, hash)?;

        if use_index {
            bucket.set_index(self.obtain_index(&bucket)?)?;
        }

        let bucket = Arc::new(bucket);
        registry.insert(hash, bucket.clone());
        if let Some(key) = merge_key {
            self.merge_map.lock().record_merge(key, hash);
        }

        tracing::debug!(%hash, size = bucket.size(), indexed = use_index, "adopted bucket");
        Ok(bucket)
    }

    /// Load a persisted index for `bucket`, or build one.
    fn obtain_index(&self, bucket: &Bucket) -> Result<BucketIndex> {
        if self.config.persist_index {
            let index_path = self.index_path(&bucket.hash());
            if index_path.exists() {
                match BucketIndex::load(&index_path, bucket.size()) {
                    Ok(index) => return Ok(index),
                    Err(e) => {
                        tracing::warn!(
                            path = %index_path.display(),
                            error = %e,
                            "failed to load persisted index, rebuilding"
                        );
                    }
                }
            }
            let index = BucketIndex::build(bucket.filename())?;
            // Write through a temp name so a crash never leaves a torn index
            // under the canonical name.
            let tmp = random_index_name(&self.tmp_dir);
            index.save(&tmp)?;
            std::fs::rename(&tmp, &index_path)?;
            return Ok(index);
        }
        BucketIndex::build(bucket.filename())
    }

    /// Registered bucket with the given hash, if any.
    pub fn get_bucket_by_hash(&self, hash: &Hash256) -> Option<Arc<Bucket>> {
        self.registry.read().get(hash).cloned()
    }

    /// Number of registered buckets.
    pub fn registered_buckets(&self) -> usize {
        self.registry.read().len()
    }

    // ========================================================================
    // Merge deduplication
    // ========================================================================

    /// Record that a merge produced the empty bucket.
    pub fn note_empty_merge_output(&self, merge_key: MergeKey) {
        self.merge_map.lock().record_merge(merge_key, Hash256::ZERO);
    }

    /// Resolve a previously completed merge to its output bucket.
    pub fn get_merge_result(&self, merge_key: &MergeKey) -> Option<Arc<Bucket>> {
        let output = self.merge_map.lock().get_output(merge_key)?;
        if output.is_zero() {
            return Some(Arc::new(Bucket::empty()));
        }
        self.get_bucket_by_hash(&output)
    }

    /// Drop the memo of a merge.
    pub fn forget_merge(&self, merge_key: &MergeKey) {
        self.merge_map.lock().forget_merge(merge_key);
    }

    // ========================================================================
    // Counters, timer, shutdown
    // ========================================================================

    /// Fold one merge's counters into the aggregate.
    pub fn incr_merge_counters(&self, counters: &MergeCounters) {
        self.merge_counters.lock().add(counters);
    }

    /// Snapshot of the aggregate merge counters.
    pub fn merge_counters(&self) -> MergeCounters {
        self.merge_counters.lock().clone()
    }

    /// Wall-time accumulator for merges.
    pub fn merge_timer(&self) -> &MergeTimer {
        &self.merge_timer
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Request shutdown; in-flight merges abort at their next poll.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for BucketManager {
    fn drop(&mut self) {
        // Reap unadopted temp files.
        let _ = std::fs::remove_dir_all(&self.tmp_dir);
    }
}

impl std::fmt::Debug for BucketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketManager")
            .field("bucket_dir", &self.bucket_dir)
            .field("registered_buckets", &self.registered_buckets())
            .field("is_shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{BucketEntry, BucketMetadata};
    use crate::iterator::BucketOutputIterator;
    use crate::model::{AccountEntry, AccountId, LedgerEntry, LedgerEntryData};

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

    fn write_bucket(manager: &BucketManager, use_index: bool) -> Arc<Bucket> {
        let meta = BucketMetadata { ledger_version: 12 };
        let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
        out.put(BucketEntry::Live(make_account_entry(1, 100))).unwrap();
        out.get_bucket(manager, use_index, None).unwrap()
    }

    #[test]
    fn test_adoption_renames_to_canonical_name() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(tmp.path().to_path_buf()).unwrap();

        let bucket = write_bucket(&manager, false);
        assert_eq!(bucket.filename(), manager.bucket_path(&bucket.hash()));
        assert!(bucket.filename().exists());
        assert_eq!(manager.registered_buckets(), 1);
    }

    #[test]
    fn test_adoption_dedups_by_hash() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(tmp.path().to_path_buf()).unwrap();

        let first = write_bucket(&manager, false);
        let second = write_bucket(&manager, false);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.registered_buckets(), 1);

        // The duplicate's temp file was discarded.
        let leftovers: Vec<_> = std::fs::read_dir(manager.tmp_dir())
            .unwrap()
            .collect::<std::io::Result<Vec<_>>>()
            .unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_random_file_names_are_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let a = random_bucket_name(tmp.path());
        std::fs::write(&a, b"occupied").unwrap();
        let b = random_bucket_name(tmp.path());
        assert_ne!(a, b);
        let name = b.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("tmp-bucket-"));
        assert!(name.ends_with(".xdr"));
        // 8 random bytes hex-encoded.
        assert_eq!(name.len(), "tmp-bucket-".len() + 16 + ".xdr".len());
    }

    #[test]
    fn test_tmp_dir_reaped_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let tmp_dir;
        {
            let manager = BucketManager::new(tmp.path().to_path_buf()).unwrap();
            tmp_dir = manager.tmp_dir().to_path_buf();
            // Abandon a temp file without adopting it.
            let meta = BucketMetadata { ledger_version: 12 };
            let mut out = BucketOutputIterator::new(manager.tmp_dir(), true, meta, false).unwrap();
            out.put(BucketEntry::Live(make_account_entry(1, 100))).unwrap();
            assert!(out.path().exists());
            drop(out);
            assert!(tmp_dir.exists());
        }
        assert!(!tmp_dir.exists());
    }

    #[test]
    fn test_persisted_index_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let config = BucketManagerConfig {
            use_index: true,
            persist_index: true,
        };
        let manager = BucketManager::with_config(tmp.path().to_path_buf(), config).unwrap();

        let bucket = write_bucket(&manager, true);
        let index_path = manager.index_path(&bucket.hash());
        assert!(index_path.exists());

        // A second manager over the same directory loads the saved index.
        drop(manager);
        let manager = BucketManager::with_config(tmp.path().to_path_buf(), config).unwrap();
        let temp_copy = random_bucket_name(manager.tmp_dir());
        std::fs::copy(manager.bucket_path(&bucket.hash()), &temp_copy).unwrap();
        let reloaded = manager
            .adopt_bucket_file(&temp_copy, bucket.hash(), true, None)
            .unwrap();
        assert!(reloaded.is_indexed());
    }

    #[test]
    fn test_shutdown_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = BucketManager::new(tmp.path().to_path_buf()).unwrap();
        assert!(!manager.is_shutdown());
        manager.shutdown();
        assert!(manager.is_shutdown());
    }

    #[test]
    fn test_merge_map() {
        let mut map = BucketMergeMap::new();
        let key = MergeKey {
            keep_dead_entries: true,
            old: Hash256::hash(b"old"),
            new: Hash256::hash(b"new"),
            shadows: vec![],
        };
        assert!(map.get_output(&key).is_none());

        let output = Hash256::hash(b"output");
        map.record_merge(key.clone(), output);
        assert_eq!(map.get_output(&key), Some(output));
        assert_eq!(map.len(), 1);

        map.forget_merge(&key);
        assert!(map.is_empty());
    }
}
