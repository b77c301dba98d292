//! Shared primitive types for the strata ledger store.
//!
//! This crate holds the handful of types every other strata crate depends on:
//! content hashes and protocol-version gating helpers. It deliberately has no
//! knowledge of buckets, ledgers, or storage formats.

mod protocol;
mod types;

pub use protocol::{protocol_version_is_before, protocol_version_starts_from};
pub use types::Hash256;
