//! Bucket lookup index.
//!
//! An index maps ledger keys to byte offsets in a published bucket file. It
//! is built on demand in one pass over the file, after publication, and is
//! read-only from then on.
//!
//! # Layouts
//!
//! Two layouts, chosen by file size at build time:
//!
//! - **Individual**: one `(key, offset)` pair per record. Exact: a lookup
//!   either yields the record's offset or a definitive miss. `page_size()`
//!   is 0, telling the read path to read a single record at the offset.
//! - **Paged**: one `(key range, offset)` pair per ~page of the file. A
//!   lookup yields the offset of the page whose range covers the key; the
//!   read path scans the page for a key-equal record and reports a bloom
//!   false positive if none is there.
//!
//! # Cursor Scans
//!
//! Batch lookups walk the index with a monotonic cursor:
//! [`BucketIndex::begin`], [`BucketIndex::scan`]. Since both the wanted keys
//! and the index are sorted, a whole batch costs one linear traversal.
//!
//! # Persistence
//!
//! An index can be serialized next to its bucket file and reloaded on
//! restart, versioned with a small header so stale layouts are rebuilt
//! rather than misread.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

use crate::bloom::{BucketBloomFilter, HashSeed, BLOOM_FILTER_MIN_KEYS};
use crate::entry::BucketEntry;
use crate::iterator::RecordStream;
use crate::model::{compare_keys, AccountId, LedgerKey, LedgerKeyType};
use crate::{BucketError, Result};

/// Byte size of one page in the paged layout.
pub const DEFAULT_PAGE_SIZE: u64 = 16 * 1024;

/// Files at or under this size get the individual (per-key) layout.
pub const INDIVIDUAL_INDEX_MAX_BYTES: u64 = 4 * 1024 * 1024;

/// Default seed for bloom filter hashing.
const DEFAULT_BLOOM_SEED: HashSeed = [0u8; 16];

/// On-disk index format version.
const INDEX_FORMAT_VERSION: u32 = 1;

/// Inclusive key range covered by one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeEntry {
    pub lower: LedgerKey,
    pub upper: LedgerKey,
}

impl RangeEntry {
    /// Whether `key` falls within this page's range.
    pub fn contains(&self, key: &LedgerKey) -> bool {
        compare_keys(&self.lower, key) != Ordering::Greater
            && compare_keys(key, &self.upper) != Ordering::Greater
    }
}

/// Position of a forward scan through the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexCursor(usize);

#[derive(Debug, Serialize, Deserialize)]
enum IndexKeys {
    Individual(Vec<(LedgerKey, u64)>),
    Paged {
        page_size: u64,
        pages: Vec<(RangeEntry, u64)>,
    },
}

/// Read-only index over one bucket file.
#[derive(Debug)]
pub struct BucketIndex {
    keys: IndexKeys,
    file_size: u64,
    bloom: Option<BucketBloomFilter>,
    bloom_misses: AtomicU64,
}

impl BucketIndex {
    /// Build an index over a published bucket file.
    ///
    /// The layout is chosen by file size: small files get per-key offsets,
    /// large files get paged ranges.
    pub fn build(path: &Path) -> Result<Self> {
        let file_size = std::fs::metadata(path)?.len();
        let page_size = if file_size <= INDIVIDUAL_INDEX_MAX_BYTES {
            0
        } else {
            DEFAULT_PAGE_SIZE
        };
        Self::build_with_page_size(path, page_size)
    }

    /// Build an index with an explicit page size (0 for the individual
    /// layout).
    pub fn build_with_page_size(path: &Path, page_size: u64) -> Result<Self> {
        let file_size = std::fs::metadata(path)?.len();
        let mut stream = RecordStream::open(path)?;

        let mut entries: Vec<(LedgerKey, u64)> = Vec::new();
        let mut offset = stream.pos();
        while let Some(entry) = stream.read_one()? {
            match entry {
                BucketEntry::Meta(_) => {
                    // META is never indexed; anywhere but the head of the
                    // file it is a malformation.
                    if offset != 0 {
                        return Err(BucketError::MalformedBucket(format!(
                            "META record mid-stream in {}",
                            path.display()
                        )));
                    }
                }
                entry => {
                    if let Some(key) = entry.key() {
                        entries.push((key, offset));
                    }
                }
            }
            offset = stream.pos();
        }

        let bloom = if entries.len() >= BLOOM_FILTER_MIN_KEYS {
            let keys: Vec<LedgerKey> = entries.iter().map(|(k, _)| k.clone()).collect();
            Some(BucketBloomFilter::build(&keys, DEFAULT_BLOOM_SEED)?)
        } else {
            None
        };

        let keys = if page_size == 0 {
            IndexKeys::Individual(entries)
        } else {
            let mut pages: Vec<(RangeEntry, u64)> = Vec::new();
            let mut page: Option<(RangeEntry, u64, u64)> = None; // (range, page offset, page end)
            for (key, off) in entries {
                let starts_new_page = match &page {
                    Some((_, _, end)) => off >= *end,
                    None => true,
                };
                if starts_new_page {
                    if let Some((range, page_off, _)) = page.take() {
                        pages.push((range, page_off));
                    }
                    page = Some((
                        RangeEntry {
                            lower: key.clone(),
                            upper: key,
                        },
                        off,
                        off + page_size,
                    ));
                } else if let Some((range, _, _)) = page.as_mut() {
                    range.upper = key;
                }
            }
            if let Some((range, page_off, _)) = page {
                pages.push((range, page_off));
            }
            IndexKeys::Paged { page_size, pages }
        };

        tracing::debug!(
            path = %path.display(),
            file_size,
            page_size,
            "built bucket index"
        );

        Ok(Self {
            keys,
            file_size,
            bloom,
            bloom_misses: AtomicU64::new(0),
        })
    }

    /// Page size of the paged layout, or 0 for per-key offsets.
    pub fn page_size(&self) -> u64 {
        match &self.keys {
            IndexKeys::Individual(_) => 0,
            IndexKeys::Paged { page_size, .. } => *page_size,
        }
    }

    /// Number of index positions (keys or pages).
    pub fn len(&self) -> usize {
        match &self.keys {
            IndexKeys::Individual(keys) => keys.len(),
            IndexKeys::Paged { pages, .. } => pages.len(),
        }
    }

    /// Whether the index covers no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up the byte offset to read for `key`.
    ///
    /// With the individual layout the offset addresses the record itself;
    /// with the paged layout it addresses the page that would hold the key.
    pub fn lookup(&self, key: &LedgerKey) -> Option<u64> {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                return None;
            }
        }
        match &self.keys {
            IndexKeys::Individual(keys) => keys
                .binary_search_by(|(k, _)| compare_keys(k, key))
                .ok()
                .map(|i| keys[i].1),
            IndexKeys::Paged { pages, .. } => {
                let i = pages.partition_point(|(range, _)| {
                    compare_keys(&range.upper, key) == Ordering::Less
                });
                pages
                    .get(i)
                    .filter(|(range, _)| range.contains(key))
                    .map(|(_, off)| *off)
            }
        }
    }

    /// Cursor at the start of the index.
    pub fn begin(&self) -> IndexCursor {
        IndexCursor(0)
    }

    /// Cursor one past the end of the index.
    pub fn end(&self) -> IndexCursor {
        IndexCursor(self.len())
    }

    /// Search forward from `cursor` for `key`.
    ///
    /// The returned cursor never moves backwards, so walking a sorted set of
    /// wanted keys against the index is linear overall.
    pub fn scan(&self, cursor: IndexCursor, key: &LedgerKey) -> (Option<u64>, IndexCursor) {
        if let Some(bloom) = &self.bloom {
            if !bloom.may_contain(key) {
                return (None, cursor);
            }
        }
        match &self.keys {
            IndexKeys::Individual(keys) => {
                let rest = &keys[cursor.0.min(keys.len())..];
                let advanced =
                    cursor.0 + rest.partition_point(|(k, _)| compare_keys(k, key) == Ordering::Less);
                let found = keys
                    .get(advanced)
                    .filter(|(k, _)| compare_keys(k, key) == Ordering::Equal)
                    .map(|(_, off)| *off);
                (found, IndexCursor(advanced))
            }
            IndexKeys::Paged { pages, .. } => {
                let rest = &pages[cursor.0.min(pages.len())..];
                let advanced = cursor.0
                    + rest.partition_point(|(range, _)| {
                        compare_keys(&range.upper, key) == Ordering::Less
                    });
                let found = pages
                    .get(advanced)
                    .filter(|(range, _)| range.contains(key))
                    .map(|(_, off)| *off);
                (found, IndexCursor(advanced))
            }
        }
    }

    /// Record a bloom filter false positive discovered by the read path.
    pub fn mark_bloom_miss(&self) {
        self.bloom_misses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Number of bloom false positives seen so far.
    pub fn bloom_miss_count(&self) -> u64 {
        self.bloom_misses.load(AtomicOrdering::Relaxed)
    }

    /// Half-open byte range of records keyed by trustlines of `account_id`.
    ///
    /// Pool-share filtering happens at read time; the range covers all of the
    /// account's trustlines. Returns None when the account has none.
    pub fn pool_share_trustline_range(&self, account_id: &AccountId) -> Option<(u64, u64)> {
        match &self.keys {
            IndexKeys::Individual(keys) => {
                let lo = keys.partition_point(|(k, _)| {
                    cmp_to_account_trustlines(k, account_id) == Ordering::Less
                });
                let hi = keys.partition_point(|(k, _)| {
                    cmp_to_account_trustlines(k, account_id) != Ordering::Greater
                });
                if lo >= hi {
                    return None;
                }
                let lo_off = keys[lo].1;
                let hi_off = keys.get(hi).map(|(_, off)| *off).unwrap_or(self.file_size);
                Some((lo_off, hi_off))
            }
            IndexKeys::Paged { pages, .. } => {
                let lo = pages.partition_point(|(range, _)| {
                    cmp_to_account_trustlines(&range.upper, account_id) == Ordering::Less
                });
                let hi = pages.partition_point(|(range, _)| {
                    cmp_to_account_trustlines(&range.lower, account_id) != Ordering::Greater
                });
                if lo >= hi {
                    return None;
                }
                let lo_off = pages[lo].1;
                let hi_off = pages.get(hi).map(|(_, off)| *off).unwrap_or(self.file_size);
                Some((lo_off, hi_off))
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Serialize the index to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, &INDEX_FORMAT_VERSION)
            .map_err(|e| BucketError::Codec(format!("failed to write index header: {}", e)))?;
        let data = PersistedIndex {
            file_size: self.file_size,
            keys: &self.keys,
            bloom: self.bloom.as_ref(),
        };
        bincode::serialize_into(&mut writer, &data)
            .map_err(|e| BucketError::Codec(format!("failed to write index: {}", e)))?;
        writer.flush()?;
        Ok(())
    }

    /// Load a previously saved index.
    ///
    /// `expected_file_size` guards against an index written for a different
    /// file; a mismatch (or an unknown format version) means the caller
    /// should rebuild.
    pub fn load(path: &Path, expected_file_size: u64) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let version: u32 = bincode::deserialize_from(&mut reader)
            .map_err(|e| BucketError::Codec(format!("failed to read index header: {}", e)))?;
        if version != INDEX_FORMAT_VERSION {
            return Err(BucketError::Codec(format!(
                "unknown index format version {}",
                version
            )));
        }
        let data: OwnedPersistedIndex = bincode::deserialize_from(&mut reader)
            .map_err(|e| BucketError::Codec(format!("failed to read index: {}", e)))?;
        if data.file_size != expected_file_size {
            return Err(BucketError::Codec(format!(
                "index covers {} bytes but bucket file has {}",
                data.file_size, expected_file_size
            )));
        }
        Ok(Self {
            keys: data.keys,
            file_size: data.file_size,
            bloom: data.bloom,
            bloom_misses: AtomicU64::new(0),
        })
    }
}

#[derive(Serialize)]
struct PersistedIndex<'a> {
    file_size: u64,
    keys: &'a IndexKeys,
    bloom: Option<&'a BucketBloomFilter>,
}

#[derive(Deserialize)]
struct OwnedPersistedIndex {
    file_size: u64,
    keys: IndexKeys,
    bloom: Option<BucketBloomFilter>,
}

/// Order `key` relative to the contiguous run of trustline keys owned by
/// `account_id`: Less before it, Equal within it, Greater after it.
fn cmp_to_account_trustlines(key: &LedgerKey, account_id: &AccountId) -> Ordering {
    match key.key_type().cmp(&LedgerKeyType::Trustline) {
        Ordering::Less => Ordering::Less,
        Ordering::Greater => Ordering::Greater,
        Ordering::Equal => match key {
            LedgerKey::Trustline { account_id: a, .. } => a.cmp(account_id),
            _ => unreachable!("key_type said Trustline"),
        },
    }
}
