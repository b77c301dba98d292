//! Error types for bucket operations.

use thiserror::Error;

/// Errors that can occur during bucket operations.
///
/// None of these are recovered locally; they unwind the operation that hit
/// them. A failed build or merge leaves at most an unadopted temp file, which
/// the manager reaps with its temp directory.
#[derive(Debug, Error)]
pub enum BucketError {
    /// Bucket file or index not found.
    #[error("bucket not found: {0}")]
    NotFound(String),

    /// Structurally invalid bucket contents (misplaced META, out-of-order
    /// records, protocol-illegal entry kinds).
    #[error("malformed bucket: {0}")]
    MalformedBucket(String),

    /// Merge invariant or protocol violation.
    #[error("bucket merge error: {0}")]
    Merge(String),

    /// Entry encode/decode failure.
    #[error("bucket codec error: {0}")]
    Codec(String),

    /// Bloom filter construction failure.
    #[error("bloom filter error: {0}")]
    BloomFilter(String),

    /// Cross-component state violated an assumed invariant.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A merge was aborted because the manager began shutting down.
    #[error("Incomplete bucket merge due to BucketManager shutdown")]
    Shutdown,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
