//! Ledger record model for bucket storage.
//!
//! Buckets store snapshots of ledger state keyed by [`LedgerKey`]. The model
//! here is deliberately closed: a small set of entry kinds that covers
//! accounts, trustlines, liquidity pools, contract data, and the TTL entries
//! that drive state eviction.
//!
//! # Key Ordering
//!
//! Entries in a bucket must be strictly sorted by key for merge and lookup to
//! work. The ordering is:
//!
//! 1. Key variant discriminant (Account < Trustline < LiquidityPool <
//!    ContractData < Ttl)
//! 2. Variant fields in declaration order
//!
//! [`compare_keys`] is the single source of truth; the sort must be identical
//! on every node or bucket hashes diverge.
//!
//! # Eviction Helpers
//!
//! Temporary contract data is subject to eviction. Each evictable entry has a
//! sibling TTL entry whose key is derived deterministically from the primary
//! key ([`ttl_key`]) and which carries the ledger sequence the entry lives
//! until ([`ttl_live_until`]).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use strata_common::Hash256;

/// 32-byte account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

/// 32-byte liquidity pool identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub [u8; 32]);

/// 32-byte contract identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractId(pub [u8; 32]);

/// An asset held on a trustline.
///
/// `PoolShare` trustlines represent a position in a liquidity pool; the pool
/// key for such a trustline is derived from the embedded [`PoolId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// The native asset.
    Native,
    /// A credit asset identified by code and issuer.
    Credit { code: [u8; 4], issuer: AccountId },
    /// A share in a liquidity pool.
    PoolShare(PoolId),
}

/// Durability class of a contract data entry.
///
/// Temporary entries are deleted outright when their TTL expires; persistent
/// entries are out of scope for the eviction scan here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Durability {
    Temporary,
    Persistent,
}

/// A key identifying one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerKey {
    Account {
        account_id: AccountId,
    },
    Trustline {
        account_id: AccountId,
        asset: Asset,
    },
    LiquidityPool {
        pool_id: PoolId,
    },
    ContractData {
        contract: ContractId,
        key: Vec<u8>,
        durability: Durability,
    },
    Ttl {
        key_hash: [u8; 32],
    },
}

/// Variant discriminant used as the major sort key.
///
/// The numeric order of these discriminants is part of the on-disk contract:
/// changing it reorders every bucket and changes every bucket hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LedgerKeyType {
    Account = 0,
    Trustline = 1,
    LiquidityPool = 2,
    ContractData = 3,
    Ttl = 4,
}

impl LedgerKey {
    /// The variant discriminant of this key.
    pub fn key_type(&self) -> LedgerKeyType {
        match self {
            LedgerKey::Account { .. } => LedgerKeyType::Account,
            LedgerKey::Trustline { .. } => LedgerKeyType::Trustline,
            LedgerKey::LiquidityPool { .. } => LedgerKeyType::LiquidityPool,
            LedgerKey::ContractData { .. } => LedgerKeyType::ContractData,
            LedgerKey::Ttl { .. } => LedgerKeyType::Ttl,
        }
    }
}

/// Compare two ledger keys.
///
/// Keys are sorted first by variant discriminant, then by variant fields in
/// declaration order. This is the total order every bucket is sorted in, and
/// it must be deterministic across nodes for bucket hashes to agree.
pub fn compare_keys(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match a.key_type().cmp(&b.key_type()) {
        Ordering::Equal => compare_keys_same_type(a, b),
        other => other,
    }
}

fn compare_keys_same_type(a: &LedgerKey, b: &LedgerKey) -> Ordering {
    match (a, b) {
        (LedgerKey::Account { account_id: a }, LedgerKey::Account { account_id: b }) => a.cmp(b),
        (
            LedgerKey::Trustline {
                account_id: aa,
                asset: ax,
            },
            LedgerKey::Trustline {
                account_id: ba,
                asset: bx,
            },
        ) => aa.cmp(ba).then_with(|| ax.cmp(bx)),
        (LedgerKey::LiquidityPool { pool_id: a }, LedgerKey::LiquidityPool { pool_id: b }) => {
            a.cmp(b)
        }
        (
            LedgerKey::ContractData {
                contract: ac,
                key: ak,
                durability: ad,
            },
            LedgerKey::ContractData {
                contract: bc,
                key: bk,
                durability: bd,
            },
        ) => ac.cmp(bc).then_with(|| ak.cmp(bk)).then_with(|| ad.cmp(bd)),
        (LedgerKey::Ttl { key_hash: a }, LedgerKey::Ttl { key_hash: b }) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

impl PartialOrd for LedgerKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LedgerKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_keys(self, other)
    }
}

/// An account entry: the native balance and sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub account_id: AccountId,
    pub balance: i64,
    pub seq_num: u64,
}

/// A trustline entry: an account's position in a non-native asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustlineEntry {
    pub account_id: AccountId,
    pub asset: Asset,
    pub balance: i64,
    pub limit: i64,
}

/// A liquidity pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidityPoolEntry {
    pub pool_id: PoolId,
    pub reserve_a: i64,
    pub reserve_b: i64,
    pub total_pool_shares: i64,
}

/// A contract data entry with an opaque value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractDataEntry {
    pub contract: ContractId,
    pub key: Vec<u8>,
    pub durability: Durability,
    pub val: Vec<u8>,
}

/// A TTL entry: how long its sibling entry lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlEntry {
    pub key_hash: [u8; 32],
    pub live_until_ledger_seq: u32,
}

/// The payload of a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryData {
    Account(AccountEntry),
    Trustline(TrustlineEntry),
    LiquidityPool(LiquidityPoolEntry),
    ContractData(ContractDataEntry),
    Ttl(TtlEntry),
}

/// One ledger entry: payload plus the sequence it was last modified in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_modified_ledger_seq: u32,
    pub data: LedgerEntryData,
}

/// Extract the [`LedgerKey`] identifying a ledger entry.
pub fn entry_key(entry: &LedgerEntry) -> LedgerKey {
    match &entry.data {
        LedgerEntryData::Account(account) => LedgerKey::Account {
            account_id: account.account_id,
        },
        LedgerEntryData::Trustline(trustline) => LedgerKey::Trustline {
            account_id: trustline.account_id,
            asset: trustline.asset,
        },
        LedgerEntryData::LiquidityPool(pool) => LedgerKey::LiquidityPool {
            pool_id: pool.pool_id,
        },
        LedgerEntryData::ContractData(data) => LedgerKey::ContractData {
            contract: data.contract,
            key: data.key.clone(),
            durability: data.durability,
        },
        LedgerEntryData::Ttl(ttl) => LedgerKey::Ttl {
            key_hash: ttl.key_hash,
        },
    }
}

/// Encode a key to its canonical byte form.
///
/// Used for TTL key derivation and bloom filter hashing. The encoding must be
/// stable: it feeds content hashes.
pub fn encode_key(key: &LedgerKey) -> Vec<u8> {
    // Key variants are bounded, encoding cannot fail.
    bincode::serialize(key).expect("ledger key encoding")
}

// ============================================================================
// Eviction helpers
// ============================================================================

/// Check if a ledger entry is a temporary contract data entry.
///
/// Only temporary entries are deleted by the eviction scan.
pub fn is_temporary_entry(entry: &LedgerEntry) -> bool {
    matches!(
        &entry.data,
        LedgerEntryData::ContractData(data) if data.durability == Durability::Temporary
    )
}

/// Derive the TTL key for a ledger key.
///
/// The TTL key is the SHA-256 of the canonical encoding of the primary key,
/// so the pairing survives serialization round trips on every node.
pub fn ttl_key(key: &LedgerKey) -> LedgerKey {
    let digest = Hash256::hash(&encode_key(key));
    LedgerKey::Ttl {
        key_hash: *digest.as_bytes(),
    }
}

/// Get the `live_until_ledger_seq` from a TTL entry.
///
/// Returns None if the entry is not a TTL entry.
pub fn ttl_live_until(entry: &LedgerEntry) -> Option<u32> {
    match &entry.data {
        LedgerEntryData::Ttl(ttl) => Some(ttl.live_until_ledger_seq),
        _ => None,
    }
}

/// Check if a TTL entry is still live at the given ledger sequence.
///
/// An entry is live while `ledger_seq <= live_until_ledger_seq`. Non-TTL
/// entries are never considered live by this check.
pub fn is_live(ttl_entry: &LedgerEntry, ledger_seq: u32) -> bool {
    ttl_live_until(ttl_entry).is_some_and(|live_until| ledger_seq <= live_until)
}

// ============================================================================
// Pool-share trustline helpers
// ============================================================================

/// Check if a key is a pool-share trustline owned by `account_id`.
pub fn is_pool_share_trustline_key(key: &LedgerKey, account_id: &AccountId) -> bool {
    matches!(
        key,
        LedgerKey::Trustline { account_id: a, asset: Asset::PoolShare(_) } if a == account_id
    )
}

/// Check if an entry payload is a pool-share trustline owned by `account_id`.
pub fn is_pool_share_trustline(entry: &LedgerEntry, account_id: &AccountId) -> bool {
    matches!(
        &entry.data,
        LedgerEntryData::Trustline(tl)
            if tl.account_id == *account_id && matches!(tl.asset, Asset::PoolShare(_))
    )
}

/// Derive the liquidity pool key from a pool-share trustline entry.
///
/// Returns None if the entry is not a pool-share trustline.
pub fn pool_key_for_trustline(entry: &LedgerEntry) -> Option<LedgerKey> {
    match &entry.data {
        LedgerEntryData::Trustline(tl) => match tl.asset {
            Asset::PoolShare(pool_id) => Some(LedgerKey::LiquidityPool { pool_id }),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_key(byte: u8) -> LedgerKey {
        LedgerKey::Account {
            account_id: AccountId([byte; 32]),
        }
    }

    #[test]
    fn test_compare_keys_same_type() {
        assert_eq!(compare_keys(&account_key(1), &account_key(2)), Ordering::Less);
        assert_eq!(compare_keys(&account_key(2), &account_key(1)), Ordering::Greater);
        assert_eq!(compare_keys(&account_key(1), &account_key(1)), Ordering::Equal);
    }

    #[test]
    fn test_compare_keys_different_types() {
        // Keys of different variants compare by discriminant first, so the
        // highest possible account still sorts before the lowest trustline.
        let account = LedgerKey::Account {
            account_id: AccountId([0xff; 32]),
        };
        let trustline = LedgerKey::Trustline {
            account_id: AccountId([0; 32]),
            asset: Asset::Native,
        };
        assert_eq!(compare_keys(&account, &trustline), Ordering::Less);
        assert_eq!(compare_keys(&trustline, &account), Ordering::Greater);
    }

    #[test]
    fn test_trustlines_sort_by_account_then_asset() {
        let a = LedgerKey::Trustline {
            account_id: AccountId([1; 32]),
            asset: Asset::PoolShare(PoolId([9; 32])),
        };
        let b = LedgerKey::Trustline {
            account_id: AccountId([2; 32]),
            asset: Asset::Native,
        };
        assert_eq!(compare_keys(&a, &b), Ordering::Less);

        let c = LedgerKey::Trustline {
            account_id: AccountId([1; 32]),
            asset: Asset::Native,
        };
        // Same account: Native sorts before PoolShare.
        assert_eq!(compare_keys(&c, &a), Ordering::Less);
    }

    #[test]
    fn test_entry_key_round_trip() {
        let entry = LedgerEntry {
            last_modified_ledger_seq: 7,
            data: LedgerEntryData::Trustline(TrustlineEntry {
                account_id: AccountId([3; 32]),
                asset: Asset::PoolShare(PoolId([4; 32])),
                balance: 10,
                limit: 100,
            }),
        };
        let key = entry_key(&entry);
        assert!(is_pool_share_trustline_key(&key, &AccountId([3; 32])));
        assert!(!is_pool_share_trustline_key(&key, &AccountId([5; 32])));
    }

    #[test]
    fn test_ttl_key_deterministic() {
        let key = LedgerKey::ContractData {
            contract: ContractId([1; 32]),
            key: vec![1, 2, 3],
            durability: Durability::Temporary,
        };
        let ttl1 = ttl_key(&key);
        let ttl2 = ttl_key(&key);
        assert_eq!(ttl1, ttl2);
        assert!(matches!(ttl1, LedgerKey::Ttl { .. }));

        let other = LedgerKey::ContractData {
            contract: ContractId([1; 32]),
            key: vec![1, 2, 4],
            durability: Durability::Temporary,
        };
        assert_ne!(ttl_key(&key), ttl_key(&other));
    }

    #[test]
    fn test_is_live() {
        let ttl = LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Ttl(TtlEntry {
                key_hash: [0; 32],
                live_until_ledger_seq: 10,
            }),
        };
        assert!(is_live(&ttl, 9));
        assert!(is_live(&ttl, 10));
        assert!(!is_live(&ttl, 11));
    }

    #[test]
    fn test_is_temporary_entry() {
        let temp = LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::ContractData(ContractDataEntry {
                contract: ContractId([1; 32]),
                key: vec![1],
                durability: Durability::Temporary,
                val: vec![],
            }),
        };
        let persistent = LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::ContractData(ContractDataEntry {
                contract: ContractId([1; 32]),
                key: vec![1],
                durability: Durability::Persistent,
                val: vec![],
            }),
        };
        assert!(is_temporary_entry(&temp));
        assert!(!is_temporary_entry(&persistent));
    }

    #[test]
    fn test_pool_key_for_trustline() {
        let entry = LedgerEntry {
            last_modified_ledger_seq: 1,
            data: LedgerEntryData::Trustline(TrustlineEntry {
                account_id: AccountId([1; 32]),
                asset: Asset::PoolShare(PoolId([7; 32])),
                balance: 1,
                limit: 10,
            }),
        };
        let pool_key = pool_key_for_trustline(&entry).unwrap();
        assert_eq!(pool_key, LedgerKey::LiquidityPool { pool_id: PoolId([7; 32]) });
    }
}
