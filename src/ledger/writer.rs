/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persists finalized pre-prepares to the ledger.
//!
//! Writing a batch is one transaction that puts, in order:
//! 1. A [`LedgerInfo::Request`] record for every request in the batch.
//! 2. A [`LedgerInfo::PrePrepare`] record for the batch itself.
//! 3. The [`OrderedRequests`] record, updated with the batch's requests.
//! 4. The batch's writes to derived tables, if any.
//!
//! Every ledger info record is written to the same key of the ledger info table, so the table itself only
//! ever holds the latest record. The full history lives in the ledger stream, where each put is kept in
//! order.

use std::fmt;

use crate::execution::AppStateUpdates;
use crate::pbft::pre_prepare::PrePrepare;
use crate::types::basic::SeqNo;

use super::{
    entries::{LedgerInfo, OrderedRequests, PrePrepareInfo},
    pluggables::{KVGetError, KVStore, Key},
    store::{CommitError, CommitSuccess, Store, Table},
    variables::{LEDGER_INFO_KEY, ORDERED_REQUESTS_KEY},
};

pub struct LedgerWriter<'s, K: KVStore> {
    store: &'s Store<K>,
    retries: usize,
}

impl<'s, K: KVStore> LedgerWriter<'s, K> {
    /// Create a writer that retries a conflicting commit up to `retries` times.
    pub fn new(store: &'s Store<K>, retries: usize) -> Self {
        Self { store, retries }
    }

    pub fn write_pre_prepare(&self, pre_prepare: &PrePrepare) -> Result<CommitSuccess, LedgerWriteError> {
        self.write_pre_prepare_with_app_state(pre_prepare, &AppStateUpdates::new())
    }

    /// Write `pre_prepare` and its requests, together with `app_state_updates`, in a single transaction.
    pub fn write_pre_prepare_with_app_state(
        &self,
        pre_prepare: &PrePrepare,
        app_state_updates: &AppStateUpdates,
    ) -> Result<CommitSuccess, LedgerWriteError> {
        let seqno = pre_prepare.seqno();
        if !pre_prepare.is_finalized() {
            return Err(LedgerWriteError::NotFinalized { seqno });
        }

        let records: Vec<Vec<u8>> = pre_prepare
            .requests()
            .iter()
            .map(|request| LedgerInfo::Request { raw: request.to_bytes() }.to_bytes())
            .chain(std::iter::once(
                LedgerInfo::PrePrepare(PrePrepareInfo::from(pre_prepare)).to_bytes(),
            ))
            .collect();

        let mut attempts = 0;
        loop {
            attempts += 1;

            let mut tx = self.store.tx()?;
            {
                let mut ledger_info = tx.get_view(&Table::pbft_info());
                for record in &records {
                    ledger_info.put(&LEDGER_INFO_KEY, record);
                }

                let mut ordered = match ledger_info.get(&ORDERED_REQUESTS_KEY) {
                    Some(bytes) => OrderedRequests::from_bytes(&bytes).map_err(|source| {
                        KVGetError::DeserializeValueError {
                            key: Key::OrderedRequests,
                            source,
                        }
                    })?,
                    None => OrderedRequests::default(),
                };
                ordered.record(pre_prepare.requests());
                ledger_info.put(&ORDERED_REQUESTS_KEY, &ordered.to_bytes());
            }
            for ((table, key), value) in app_state_updates.inserts() {
                tx.get_view(table).put(key, value);
            }
            for (table, key) in app_state_updates.deletes() {
                tx.get_view(table).remove(key);
            }

            match tx.commit() {
                Ok(success) => return Ok(success),
                Err(CommitError::Conflict { expected, found }) if attempts <= self.retries => {
                    log::debug!(
                        "Ledger write of seqno {} conflicted (began at {}, found {}); retrying",
                        seqno,
                        expected,
                        found
                    );
                }
                Err(source) => {
                    return Err(LedgerWriteError::CommitFailed {
                        seqno,
                        attempts,
                        source,
                    })
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum LedgerWriteError {
    /// The pre-prepare's merkle roots and ctx have not been set.
    NotFinalized { seqno: SeqNo },
    /// The transaction could not be committed, even after retrying.
    CommitFailed {
        seqno: SeqNo,
        attempts: usize,
        source: CommitError,
    },
    KVGetError(KVGetError),
}

impl From<KVGetError> for LedgerWriteError {
    fn from(value: KVGetError) -> Self {
        LedgerWriteError::KVGetError(value)
    }
}

impl fmt::Display for LedgerWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerWriteError::NotFinalized { seqno } => {
                write!(f, "pre-prepare at seqno {} is not finalized", seqno)
            }
            LedgerWriteError::CommitFailed {
                seqno,
                attempts,
                source,
            } => write!(
                f,
                "failed to write seqno {} after {} attempts: {}",
                seqno, attempts, source
            ),
            LedgerWriteError::KVGetError(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for LedgerWriteError {}
