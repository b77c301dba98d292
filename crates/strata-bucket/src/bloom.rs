//! Binary fuse filter for fast negative lookups in bucket indexes.
//!
//! Before touching the disk, a point lookup asks this filter whether the key
//! could be in the bucket at all. A `false` answer is definitive (no false
//! negatives); a `true` answer may be a false positive, which the read path
//! detects and reports back through `mark_bloom_miss`.
//!
//! The filter is a `BinaryFuse16` over SipHash-2-4 key hashes: roughly 18
//! bits per entry with a false positive rate around 1/65536. Construction
//! can fail on degenerate hash collisions, in which case the seed is rotated
//! and the hashes recomputed, up to a bounded number of attempts.

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;
use xorf::{BinaryFuse16, Filter};

use crate::model::{encode_key, LedgerKey};
use crate::{BucketError, Result};

/// Size of the SipHash key in bytes (128 bits).
pub const HASH_KEY_BYTES: usize = 16;

/// Hash seed used for bloom filter construction.
pub type HashSeed = [u8; HASH_KEY_BYTES];

/// Minimum number of keys worth building a filter for.
///
/// Below this the index's own key list answers negative lookups just as fast.
pub(crate) const BLOOM_FILTER_MIN_KEYS: usize = 2;

const MAX_BUILD_ATTEMPTS: usize = 10;

/// A binary fuse filter over the keys of one bucket.
#[derive(Clone, Serialize, Deserialize)]
pub struct BucketBloomFilter {
    filter: BinaryFuse16,
    seed: HashSeed,
}

impl BucketBloomFilter {
    /// Build a filter over the given keys.
    ///
    /// Construction retries with a rotated seed when the underlying filter
    /// rejects the hash set; the seed that succeeded is stored so lookups
    /// hash consistently.
    pub fn build(keys: &[LedgerKey], seed: HashSeed) -> Result<Self> {
        if keys.len() < BLOOM_FILTER_MIN_KEYS {
            return Err(BucketError::BloomFilter(format!(
                "bloom filter requires at least {} keys",
                BLOOM_FILTER_MIN_KEYS
            )));
        }

        let encoded: Vec<Vec<u8>> = keys.iter().map(encode_key).collect();

        let mut attempt_seed = seed;
        for attempt in 0..MAX_BUILD_ATTEMPTS {
            let hashes: Vec<u64> = encoded
                .iter()
                .map(|bytes| Self::hash_bytes(bytes, &attempt_seed))
                .collect();
            match BinaryFuse16::try_from(hashes.as_slice()) {
                Ok(filter) => {
                    return Ok(Self {
                        filter,
                        seed: attempt_seed,
                    })
                }
                Err(e) if attempt + 1 < MAX_BUILD_ATTEMPTS => {
                    tracing::debug!(attempt, error = ?e, "bloom filter build retry");
                    attempt_seed[0] = attempt_seed[0].wrapping_add(1);
                }
                Err(e) => {
                    return Err(BucketError::BloomFilter(format!(
                        "failed to construct bloom filter after {} attempts: {:?}",
                        MAX_BUILD_ATTEMPTS, e
                    )))
                }
            }
        }

        unreachable!("bloom filter build loop always returns");
    }

    /// SipHash-2-4 of a ledger key under the given seed.
    pub fn hash_key(key: &LedgerKey, seed: &HashSeed) -> u64 {
        Self::hash_bytes(&encode_key(key), seed)
    }

    /// SipHash-2-4 of raw bytes under the given seed.
    pub fn hash_bytes(bytes: &[u8], seed: &HashSeed) -> u64 {
        let mut hasher = SipHasher24::new_with_key(seed);
        hasher.write(bytes);
        hasher.finish()
    }

    /// Check whether a key might be in the set.
    ///
    /// `false` means definitely absent; `true` means possibly present.
    pub fn may_contain(&self, key: &LedgerKey) -> bool {
        self.filter.contains(&Self::hash_key(key, &self.seed))
    }

    /// The seed the filter was built with.
    pub fn seed(&self) -> &HashSeed {
        &self.seed
    }

    /// Approximate filter size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.filter.len() * std::mem::size_of::<u16>()
    }
}

impl std::fmt::Debug for BucketBloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketBloomFilter")
            .field("size_bytes", &self.size_bytes())
            .finish()
    }
}
