/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Byte-prefixes that specify where each variable of the [store](super::store::Store) lives in the
//! user-provided key-value store.
//!
//! # List of variables
//!
//! |Variable|Type|Description|
//! |---|---|---|
//! |Store Version|[`Version`](super::store::Version)|Number of transactions committed to (or replayed into) the store.|
//! |Tables|`(String, Vec<u8>)` -> `Vec<u8>`|Contents of every named table, replicated and derived alike.|
//!
//! The ledger info table, [`PBFT_INFO`], is a replicated table with two keys:
//! - [`LEDGER_INFO_KEY`], holding a Borsh-serialized [`LedgerInfo`](super::entries::LedgerInfo).
//! - [`ORDERED_REQUESTS_KEY`], holding a Borsh-serialized
//!   [`OrderedRequests`](super::entries::OrderedRequests).
//!
//! # Persistence
//!
//! The store version is a single value stored at the one-byte constant key [`STORE_VERSION`].
//!
//! Tables are mappings. An entry of a table is stored at the concatenation of the one-byte [`TABLES`]
//! prefix, the Borsh serialization of the table's name, and the entry's key. Serializing the name
//! length-prefixes it, so no two tables share a key space.

use borsh::BorshSerialize;

pub const TABLES: [u8; 1] = [0];
pub const STORE_VERSION: [u8; 1] = [1];

/// Name of the ledger info table.
pub const PBFT_INFO: &str = "pbft.info";

/// Key of the latest ledger info record.
pub const LEDGER_INFO_KEY: [u8; 8] = 0u64.to_le_bytes();

pub const ORDERED_REQUESTS_KEY: [u8; 8] = 1u64.to_le_bytes();

/// Takes references to two byteslices and returns a vector containing the bytes of the first one, and
/// then the bytes of the second one.
pub fn concat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

/// The key at which `key` of table `table` is stored.
pub fn table_key(table: &str, key: &[u8]) -> Vec<u8> {
    // Safety: serializing into a Vec<u8> cannot fail.
    let table_prefix = table.try_to_vec().unwrap();
    concat(&TABLES, &concat(&table_prefix, key))
}
