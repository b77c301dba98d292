//! Streaming bucket iterators.
//!
//! Bucket files are a sequence of length-prefixed binary records: a 4-byte
//! big-endian length followed by the entry payload. This module provides the
//! framing, a seekable [`RecordStream`] used by the lookup and eviction
//! paths, and the two streaming iterators the engine is built on:
//!
//! - [`BucketInputIterator`]: forward, restartable scan of a bucket file that
//!   consumes the leading META record into [`BucketInputIterator::metadata`]
//! - [`BucketOutputIterator`]: streaming writer that enforces strict key
//!   order, filters tombstones at the bottom level, accumulates the content
//!   hash, and publishes through the manager
//!
//! Only one entry is held in memory at a time, so buckets far larger than
//! RAM stream through merges without pressure.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use strata_common::{protocol_version_starts_from, Hash256};

use crate::bucket::Bucket;
use crate::entry::{compare_entries, BucketEntry, BucketMetadata};
use crate::manager::{random_bucket_name, BucketManager};
use crate::merge::MergeKey;
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

// ============================================================================
// Record framing
// ============================================================================

/// Read a single length-prefixed record from the stream.
///
/// Returns None at a clean EOF. A truncated length prefix or payload is an
/// IO error.
pub(crate) fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(BucketError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Write a single length-prefixed record, returning the bytes consumed.
pub(crate) fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> Result<usize> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(4 + payload.len())
}

// ============================================================================
// Seekable record stream
// ============================================================================

/// A seekable reader over a bucket file's records.
///
/// This is the handle cached inside a bucket for point lookups and eviction
/// scans. It is not thread-safe; the bucket guards each cached stream with a
/// mutex.
#[derive(Debug)]
pub(crate) struct RecordStream {
    reader: BufReader<File>,
    pos: u64,
}

impl RecordStream {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| BucketError::NotFound(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            reader: BufReader::new(file),
            pos: 0,
        })
    }

    /// Current byte position (start of the next record).
    pub(crate) fn pos(&self) -> u64 {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    /// Read and decode the record at the current position.
    pub(crate) fn read_one(&mut self) -> Result<Option<BucketEntry>> {
        match read_record(&mut self.reader)? {
            None => Ok(None),
            Some(payload) => {
                self.pos += 4 + payload.len() as u64;
                Ok(Some(BucketEntry::from_bytes(&payload)?))
            }
        }
    }

    /// Scan the page starting at the current position for a key-equal entry.
    ///
    /// Reads records until `page_size` bytes have been consumed or EOF,
    /// returning the entry whose key equals `key` if one is present.
    pub(crate) fn read_page(
        &mut self,
        key: &crate::model::LedgerKey,
        page_size: u64,
    ) -> Result<Option<BucketEntry>> {
        let end = self.pos + page_size;
        while self.pos < end {
            match self.read_one()? {
                None => break,
                Some(entry) => {
                    if entry.key().as_ref() == Some(key) {
                        return Ok(Some(entry));
                    }
                }
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Bucket input iterator
// ============================================================================

/// A forward streaming iterator over the entries of one bucket.
///
/// Opening the iterator reads the leading META record (if any) into
/// [`metadata`](Self::metadata) and positions on the first keyed entry. The
/// iterator is restartable by reopening; each iterator owns its file handle
/// and never shares the bucket's cached streams.
pub struct BucketInputIterator {
    stream: Option<RecordStream>,
    path: PathBuf,
    current: Option<BucketEntry>,
    seen_metadata: bool,
    seen_other_entries: bool,
    metadata: BucketMetadata,
    entries_read: usize,
}

impl BucketInputIterator {
    /// Open an iterator over a bucket.
    ///
    /// The empty bucket yields an exhausted iterator with zero metadata.
    pub fn open(bucket: &Bucket) -> Result<Self> {
        if bucket.is_empty() {
            return Ok(Self {
                stream: None,
                path: PathBuf::new(),
                current: None,
                seen_metadata: false,
                seen_other_entries: false,
                metadata: BucketMetadata::default(),
                entries_read: 0,
            });
        }
        Self::open_path(bucket.filename())
    }

    /// Open an iterator over a bucket file directly.
    pub fn open_path(path: &Path) -> Result<Self> {
        let stream = RecordStream::open(path)?;
        let mut iter = Self {
            stream: Some(stream),
            path: path.to_path_buf(),
            current: None,
            seen_metadata: false,
            seen_other_entries: false,
            metadata: BucketMetadata::default(),
            entries_read: 0,
        };
        iter.load_entry()?;
        Ok(iter)
    }

    fn load_entry(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            self.current = None;
            return Ok(());
        };
        loop {
            match stream.read_one()? {
                None => {
                    self.current = None;
                    return Ok(());
                }
                Some(BucketEntry::Meta(meta)) => {
                    if self.seen_metadata {
                        return Err(BucketError::MalformedBucket(format!(
                            "multiple META records in {}",
                            self.path.display()
                        )));
                    }
                    if self.seen_other_entries {
                        return Err(BucketError::MalformedBucket(format!(
                            "META record mid-stream in {}",
                            self.path.display()
                        )));
                    }
                    self.seen_metadata = true;
                    self.metadata = meta;
                }
                Some(entry) => {
                    self.seen_other_entries = true;
                    self.entries_read += 1;
                    self.current = Some(entry);
                    return Ok(());
                }
            }
        }
    }

    /// True while the iterator has a current entry.
    pub fn has_next(&self) -> bool {
        self.current.is_some()
    }

    /// The current entry, without advancing.
    pub fn peek(&self) -> Option<&BucketEntry> {
        self.current.as_ref()
    }

    /// Take the current entry and advance.
    pub fn next(&mut self) -> Result<Option<BucketEntry>> {
        let current = self.current.take();
        if current.is_some() {
            self.load_entry()?;
        }
        Ok(current)
    }

    /// Advance past the current entry, discarding it.
    pub fn advance(&mut self) -> Result<()> {
        self.next().map(|_| ())
    }

    /// Bucket metadata read from the leading META record.
    ///
    /// Zero-valued for buckets written before META existed.
    pub fn metadata(&self) -> &BucketMetadata {
        &self.metadata
    }

    /// Whether a META record was present.
    pub fn seen_metadata(&self) -> bool {
        self.seen_metadata
    }

    /// Number of keyed entries read so far.
    pub fn entries_read(&self) -> usize {
        self.entries_read
    }
}

impl std::fmt::Debug for BucketInputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketInputIterator")
            .field("path", &self.path)
            .field("entries_read", &self.entries_read)
            .field("has_current", &self.current.is_some())
            .finish()
    }
}

// ============================================================================
// Bucket output iterator
// ============================================================================

/// A streaming writer producing a new bucket file.
///
/// Entries must arrive in strictly ascending key order: an equal-keyed put
/// replaces the buffered entry (the newer value wins), a regression is a
/// malformation error. When `keep_dead_entries` is false (the bottom level
/// of the hierarchy), DEAD entries are filtered out entirely, independent of
/// protocol version.
///
/// The writer targets a randomly named temp file under the manager's temp
/// directory and feeds every frame into a running SHA-256.
/// [`get_bucket`](Self::get_bucket) is the commit point: until then an
/// abandoned writer leaves only an unadopted temp file behind.
pub struct BucketOutputIterator {
    writer: BufWriter<File>,
    path: PathBuf,
    buffer: Option<BucketEntry>,
    keep_dead_entries: bool,
    put_meta: bool,
    objects_put: usize,
    hasher: Sha256,
    bytes_written: u64,
    do_fsync: bool,
}

impl BucketOutputIterator {
    /// Create a writer in `tmp_dir`, emitting a META record when the
    /// protocol version supports one.
    pub fn new(
        tmp_dir: &Path,
        keep_dead_entries: bool,
        meta: BucketMetadata,
        do_fsync: bool,
    ) -> Result<Self> {
        let path = random_bucket_name(tmp_dir);
        let file = File::create(&path)?;
        let writer = BufWriter::new(file);

        let mut out = Self {
            writer,
            path,
            buffer: None,
            keep_dead_entries,
            put_meta: false,
            objects_put: 0,
            hasher: Sha256::new(),
            bytes_written: 0,
            do_fsync,
        };

        if protocol_version_starts_from(
            meta.ledger_version,
            FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
        ) {
            out.write_entry_raw(&BucketEntry::Meta(meta))?;
            out.put_meta = true;
        }

        Ok(out)
    }

    fn write_entry_raw(&mut self, entry: &BucketEntry) -> Result<()> {
        let payload = entry.to_bytes()?;
        self.hasher.update((payload.len() as u32).to_be_bytes());
        self.hasher.update(&payload);
        self.bytes_written += write_record(&mut self.writer, &payload)? as u64;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if let Some(entry) = self.buffer.take() {
            self.objects_put += 1;
            self.write_entry_raw(&entry)?;
        }
        Ok(())
    }

    /// Append one entry.
    ///
    /// Entries must be strictly ascending by key; an equal-keyed entry
    /// replaces the buffered one and a regression is fatal.
    pub fn put(&mut self, entry: BucketEntry) -> Result<()> {
        if entry.is_meta() {
            return Err(BucketError::MalformedBucket(
                "META record put mid-stream".to_string(),
            ));
        }

        // Secondary tombstone elision at the oldest level, independent of
        // protocol version.
        if entry.is_dead() && !self.keep_dead_entries {
            return Ok(());
        }

        match self.buffer.as_ref() {
            None => {
                self.buffer = Some(entry);
            }
            Some(buffered) => match compare_entries(buffered, &entry) {
                std::cmp::Ordering::Less => {
                    self.flush_buffer()?;
                    self.buffer = Some(entry);
                }
                std::cmp::Ordering::Equal => {
                    self.buffer = Some(entry);
                }
                std::cmp::Ordering::Greater => {
                    return Err(BucketError::MalformedBucket(
                        "entries put out of order".to_string(),
                    ));
                }
            },
        }

        Ok(())
    }

    /// Number of keyed entries committed to the file so far.
    pub fn entries_put(&self) -> usize {
        self.objects_put
    }

    /// Bytes written to the file so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Path of the temp file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finalize the file and hand it to the manager.
    ///
    /// Flushes (and optionally fsyncs) the temp file, then asks the manager
    /// to adopt it under its canonical hash-derived name. If the manager
    /// already holds a bucket with this hash, the temp file is discarded and
    /// the existing handle returned. A writer that put nothing (and no META)
    /// yields the distinguished empty bucket. `merge_key`, when supplied,
    /// records the merge provenance with the manager so identical merges
    /// resolve without re-running.
    pub fn get_bucket(
        mut self,
        manager: &BucketManager,
        use_index: bool,
        merge_key: Option<MergeKey>,
    ) -> Result<Arc<Bucket>> {
        self.flush_buffer()?;
        self.writer.flush()?;
        if self.do_fsync {
            self.writer.get_ref().sync_all()?;
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&self.hasher.finalize());
        let hash = Hash256::from_bytes(digest);

        if self.objects_put == 0 && !self.put_meta {
            std::fs::remove_file(&self.path)?;
            if let Some(key) = merge_key {
                manager.note_empty_merge_output(key);
            }
            return Ok(Arc::new(Bucket::empty()));
        }

        manager.adopt_bucket_file(&self.path, hash, use_index, merge_key)
    }
}

impl std::fmt::Debug for BucketOutputIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketOutputIterator")
            .field("path", &self.path)
            .field("entries_put", &self.objects_put)
            .field("bytes_written", &self.bytes_written)
            .field("has_buffer", &self.buffer.is_some())
            .finish()
    }
}
