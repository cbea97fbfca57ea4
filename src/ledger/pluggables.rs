/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Traits for pluggable ledger persistence.
//!
//! The library user provides the key-value store that backs the [store adaptor](super::store::Store) by
//! implementing [`KVStore`]. The adaptor never assumes anything about the store beyond these traits.

use std::fmt::Display;

use borsh::BorshDeserialize;

use super::{
    entries::{LedgerInfo, OrderedRequests},
    store::Version,
    variables::{self, table_key},
};

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    /// Atomically apply every insertion and deletion in `wb`.
    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ Store Version ↓↓↓ */

    fn store_version(&self) -> Result<Version, KVGetError> {
        if let Some(bytes) = self.get(&variables::STORE_VERSION) {
            Version::deserialize(&mut bytes.as_slice()).map_err(|err| KVGetError::DeserializeValueError {
                key: Key::StoreVersion,
                source: err,
            })
        } else {
            Ok(Version::init())
        }
    }

    /* ↓↓↓ Tables ↓↓↓ */

    fn table_value(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.get(&table_key(table, key))
    }

    /* ↓↓↓ Ledger Info ↓↓↓ */

    fn ledger_info(&self) -> Result<Option<LedgerInfo>, KVGetError> {
        if let Some(bytes) = self.table_value(variables::PBFT_INFO, &variables::LEDGER_INFO_KEY) {
            Ok(Some(LedgerInfo::deserialize(&mut bytes.as_slice()).map_err(|err| {
                KVGetError::DeserializeValueError {
                    key: Key::LedgerInfo,
                    source: err,
                }
            })?))
        } else {
            Ok(None)
        }
    }

    fn ordered_requests(&self) -> Result<Option<OrderedRequests>, KVGetError> {
        match self.table_value(variables::PBFT_INFO, &variables::ORDERED_REQUESTS_KEY) {
            Some(bytes) => OrderedRequests::from_bytes(&bytes)
                .map(Some)
                .map_err(|err| KVGetError::DeserializeValueError {
                    key: Key::OrderedRequests,
                    source: err,
                }),
            None => Ok(None),
        }
    }
}

/// Error when trying to read a value corresponding to a given key from the [key value store][KVStore].
/// The error arises when the value corresponding to a given key cannot be deserialized into its expected
/// type.
#[derive(Debug)]
pub enum KVGetError {
    DeserializeValueError { key: Key, source: std::io::Error },
}

impl Display for KVGetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KVGetError::DeserializeValueError { key, source } => {
                write!(f, "failed to deserialize {}: {}", key, source)
            }
        }
    }
}

impl std::error::Error for KVGetError {}

#[derive(Debug)]
pub enum Key {
    StoreVersion,
    LedgerInfo,
    OrderedRequests,
}

impl Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self {
            &Key::StoreVersion => write!(f, "Store Version"),
            &Key::LedgerInfo => write!(f, "Ledger Info"),
            &Key::OrderedRequests => write!(f, "Ordered Requests"),
        }
    }
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}
