//! Bucket entry types.
//!
//! A bucket is a sorted sequence of [`BucketEntry`] records. Entries wrap
//! ledger records with the lifecycle state that drives merge semantics.
//!
//! | Kind   | Payload       | Meaning                                        |
//! |--------|---------------|------------------------------------------------|
//! | `Live` | `LedgerEntry` | Current value at the key                       |
//! | `Init` | `LedgerEntry` | First-ever creation; prior state is DEAD/absent|
//! | `Dead` | `LedgerKey`   | Tombstone for the key                          |
//! | `Meta` | metadata      | Leading record carrying the protocol version   |
//!
//! `Meta` may only appear as the very first record of a bucket file. It has
//! no ledger key and sorts before every keyed entry.
//!
//! # Serialization
//!
//! Entries serialize to a self-describing binary payload; the surrounding
//! length-prefixed framing lives in the iterator module. The encoding is part
//! of the on-disk contract because bucket hashes are computed over the exact
//! file bytes.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use strata_common::protocol_version_is_before;

use crate::model::{compare_keys, entry_key, LedgerEntry, LedgerKey};
use crate::{BucketError, Result, FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY};

/// Metadata carried by the leading record of a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMetadata {
    /// Ledger protocol version the bucket was written under.
    pub ledger_version: u32,
}

/// An entry stored in a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketEntry {
    /// A live ledger entry (the current state of this key).
    Live(LedgerEntry),
    /// An initialization entry: the first-ever creation of this key.
    ///
    /// Carries the invariant that the chronologically preceding state at the
    /// key is DEAD or nonexistent, which is what allows a later Init+Dead
    /// pair to annihilate during a merge.
    Init(LedgerEntry),
    /// A tombstone marking that this key has been deleted.
    Dead(LedgerKey),
    /// Bucket metadata; only legal as the first record of a file.
    Meta(BucketMetadata),
}

impl BucketEntry {
    /// Parse an entry from its serialized payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| BucketError::Codec(format!("failed to decode bucket entry: {}", e)))
    }

    /// Serialize the entry to payload bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| BucketError::Codec(format!("failed to encode bucket entry: {}", e)))
    }

    /// Get the ledger key of this entry.
    ///
    /// Returns None for metadata, which has no key.
    pub fn key(&self) -> Option<LedgerKey> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(entry_key(entry)),
            BucketEntry::Dead(key) => Some(key.clone()),
            BucketEntry::Meta(_) => None,
        }
    }

    /// Check if this is a live entry.
    pub fn is_live(&self) -> bool {
        matches!(self, BucketEntry::Live(_))
    }

    /// Check if this is an init entry.
    pub fn is_init(&self) -> bool {
        matches!(self, BucketEntry::Init(_))
    }

    /// Check if this is a dead entry (tombstone).
    pub fn is_dead(&self) -> bool {
        matches!(self, BucketEntry::Dead(_))
    }

    /// Check if this is a metadata entry.
    pub fn is_meta(&self) -> bool {
        matches!(self, BucketEntry::Meta(_))
    }

    /// Get the ledger entry if this is a live or init entry.
    pub fn as_ledger_entry(&self) -> Option<&LedgerEntry> {
        match self {
            BucketEntry::Live(entry) | BucketEntry::Init(entry) => Some(entry),
            _ => None,
        }
    }

    /// Short name of the entry kind, for error messages and logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            BucketEntry::Live(_) => "LIVE",
            BucketEntry::Init(_) => "INIT",
            BucketEntry::Dead(_) => "DEAD",
            BucketEntry::Meta(_) => "META",
        }
    }
}

/// Compare two bucket entries by ledger key.
///
/// Only the key participates in ordering; the entry kind is ignored. Metadata
/// has no key and sorts before everything else.
pub fn compare_entries(a: &BucketEntry, b: &BucketEntry) -> Ordering {
    match (a.key(), b.key()) {
        (Some(key_a), Some(key_b)) => compare_keys(&key_a, &key_b),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Reject entry kinds that are illegal under the given protocol version.
///
/// INIT and META records only exist from
/// [`FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY`] on; encountering one
/// in an older-protocol stream means the bucket is malformed.
pub fn check_protocol_legality(entry: &BucketEntry, protocol_version: u32) -> Result<()> {
    if protocol_version_is_before(
        protocol_version,
        FIRST_PROTOCOL_SUPPORTING_INITENTRY_AND_METAENTRY,
    ) && (entry.is_init() || entry.is_meta())
    {
        return Err(BucketError::MalformedBucket(format!(
            "unsupported entry kind {} in protocol {} bucket",
            entry.kind_name(),
            protocol_version
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AccountEntry, AccountId, LedgerEntryData};

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

    #[test]
    fn test_entry_kinds() {
        let live = BucketEntry::Live(make_account_entry(1, 100));
        let dead = BucketEntry::Dead(make_account_key(1));
        let init = BucketEntry::Init(make_account_entry(1, 100));
        let meta = BucketEntry::Meta(BucketMetadata { ledger_version: 11 });

        assert!(live.is_live() && !live.is_dead() && !live.is_init() && !live.is_meta());
        assert!(dead.is_dead() && !dead.is_live());
        assert!(init.is_init() && !init.is_live());
        assert!(meta.is_meta());
        assert!(meta.key().is_none());
    }

    #[test]
    fn test_entry_key() {
        let entry = BucketEntry::Live(make_account_entry(3, 100));
        assert_eq!(entry.key().unwrap(), make_account_key(3));

        let dead = BucketEntry::Dead(make_account_key(4));
        assert_eq!(dead.key().unwrap(), make_account_key(4));
    }

    #[test]
    fn test_compare_entries_by_key_only() {
        let live = BucketEntry::Live(make_account_entry(1, 100));
        let dead = BucketEntry::Dead(make_account_key(1));
        let other = BucketEntry::Init(make_account_entry(2, 200));

        // Kind is ignored for ordering.
        assert_eq!(compare_entries(&live, &dead), Ordering::Equal);
        assert_eq!(compare_entries(&live, &other), Ordering::Less);
    }

    #[test]
    fn test_meta_sorts_first() {
        let meta = BucketEntry::Meta(BucketMetadata { ledger_version: 11 });
        let live = BucketEntry::Live(make_account_entry(0, 1));
        assert_eq!(compare_entries(&meta, &live), Ordering::Less);
        assert_eq!(compare_entries(&live, &meta), Ordering::Greater);
    }

    #[test]
    fn test_codec_round_trip() {
        let entries = vec![
            BucketEntry::Live(make_account_entry(1, 100)),
            BucketEntry::Init(make_account_entry(2, 200)),
            BucketEntry::Dead(make_account_key(3)),
            BucketEntry::Meta(BucketMetadata { ledger_version: 12 }),
        ];
        for entry in entries {
            let bytes = entry.to_bytes().unwrap();
            let decoded = BucketEntry::from_bytes(&bytes).unwrap();
            assert_eq!(entry, decoded);
        }
    }

    #[test]
    fn test_protocol_legality() {
        let init = BucketEntry::Init(make_account_entry(1, 100));
        let meta = BucketEntry::Meta(BucketMetadata { ledger_version: 10 });
        let live = BucketEntry::Live(make_account_entry(1, 100));

        assert!(check_protocol_legality(&init, 10).is_err());
        assert!(check_protocol_legality(&meta, 10).is_err());
        assert!(check_protocol_legality(&live, 10).is_ok());
        assert!(check_protocol_legality(&init, 11).is_ok());
        assert!(check_protocol_legality(&meta, 11).is_ok());
    }
}
