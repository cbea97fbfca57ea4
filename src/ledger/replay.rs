/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reconstruction of replica state from a ledger stream.
//!
//! Replay walks the entries of a ledger stream in the order they were committed and applies each one
//! through [`Store::deserialise`]. Alongside the store, it maintains a [`ReplayState`]: the last
//! sequence number executed, the requests that have been replayed but not yet batched, and the last
//! request id seen from each client.
//!
//! ## Acceptance
//!
//! An entry is accepted only if every ledger info record it contains is acceptable, in order:
//! - A `Request` record must decode into a request whose digest (and signature, if any) verifies, and
//!   whose id is greater than any earlier request from the same client.
//! - A `PrePrepare` record must carry `seqno == last_executed + 1`, and there must be at least
//!   `num_requests` pending requests for it to consume.
//!
//! Records are checked against a scratch copy of the replay state, which replaces the real one only if
//! the whole entry is accepted. A rejected entry changes neither the store nor the replay state, so the
//! caller may abort, or resume with a correctly ordered stream.
//!
//! ## Re-execution
//!
//! If the replay re-executes, the batches that an entry completes are handed to the executor only
//! after every record in the entry has passed the checks above. Executing them must then reproduce both
//! merkle roots recorded in their pre-prepares. The executor cannot undo a batch, so a failure at this
//! stage leaves it ahead of the store, and the replica that owns it halts.
//!
//! Writes to derived tables never reach this module: the store drops them before calling the hook.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use crate::execution::{check_roots, execute_batch, ExecutionFault, Executor};
use crate::types::{
    basic::{ClientId, RequestId, SeqNo},
    principals::PrincipalSet,
    request::{AuthError, Request},
};

use super::{
    entries::{LedgerInfo, PrePrepareInfo},
    pluggables::{KVGetError, KVStore},
    store::{Store, TableWrite, Version},
    variables::{LEDGER_INFO_KEY, PBFT_INFO},
};

/// Outcome of replaying one entry of a ledger stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeserialiseSuccess {
    /// The entry was rejected. Neither the store nor the replay state changed.
    Failed,
    /// The entry was applied.
    Pass,
    /// The entry was applied, and it contained an accepted pre-prepare.
    PassPrePrepare,
}

#[derive(Clone, Debug, Default)]
pub struct ReplayState {
    last_executed: SeqNo,
    pending: VecDeque<Request>,
    last_request_ids: HashMap<ClientId, RequestId>,
    total_requests_executed: u64,
}

impl ReplayState {
    pub fn new() -> ReplayState {
        ReplayState::default()
    }

    /// The highest sequence number whose pre-prepare has been accepted.
    pub fn last_executed(&self) -> SeqNo {
        self.last_executed
    }

    /// Number of replayed requests not yet consumed by a pre-prepare.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn total_requests_executed(&self) -> u64 {
        self.total_requests_executed
    }

    /// Get the last request id replayed for `client`, if any.
    pub fn last_request_id(&self, client: ClientId) -> Option<RequestId> {
        self.last_request_ids.get(&client).copied()
    }

    /// Get an iterator through the last request id replayed for every client.
    pub fn last_request_ids(&self) -> impl Iterator<Item = (ClientId, RequestId)> + '_ {
        self.last_request_ids
            .iter()
            .map(|(client, request_id)| (*client, *request_id))
    }

    /// Replay `entry` into `store`.
    ///
    /// `principals` provides the keys to verify signed requests with. If `executor` is provided, each
    /// replayed batch is re-executed and its merkle roots checked.
    pub fn replay_entry<K: KVStore>(
        &mut self,
        store: &Store<K>,
        entry: &[u8],
        principals: Option<&PrincipalSet>,
        executor: Option<&mut dyn Executor>,
    ) -> Result<DeserialiseSuccess, ReplayError> {
        let (scratch, saw_pre_prepare) = store.deserialise(entry, |_, writes| {
            let mut scratch = self.clone();
            let saw_pre_prepare = scratch.apply(writes, principals, executor)?;
            Ok((scratch, saw_pre_prepare))
        })?;

        *self = scratch;
        if saw_pre_prepare {
            Ok(DeserialiseSuccess::PassPrePrepare)
        } else {
            Ok(DeserialiseSuccess::Pass)
        }
    }

    /// Like [`replay_entry`](Self::replay_entry), but reports rejection as [`DeserialiseSuccess::Failed`],
    /// logging the reason.
    pub fn deserialise<K: KVStore>(
        &mut self,
        store: &Store<K>,
        entry: &[u8],
        principals: Option<&PrincipalSet>,
        executor: Option<&mut dyn Executor>,
    ) -> DeserialiseSuccess {
        match self.replay_entry(store, entry, principals, executor) {
            Ok(success) => success,
            Err(err) => {
                log::warn!("Ledger entry rejected after seqno {}: {}", self.last_executed, err);
                DeserialiseSuccess::Failed
            }
        }
    }

    // Check every record in `writes`, then re-execute the batches that the records complete. Returns
    // whether `writes` contained a pre-prepare.
    fn apply(
        &mut self,
        writes: &[TableWrite],
        principals: Option<&PrincipalSet>,
        executor: Option<&mut dyn Executor>,
    ) -> Result<bool, ReplayError> {
        let mut batches: Vec<(PrePrepareInfo, Vec<Request>, u64)> = Vec::new();
        for write in writes {
            if write.table != PBFT_INFO || write.key != LEDGER_INFO_KEY {
                continue;
            }
            let value = write.value.as_ref().ok_or(ReplayError::LedgerInfoRemoved)?;
            let ledger_info =
                LedgerInfo::from_bytes(value).map_err(|source| ReplayError::MalformedLedgerInfo { source })?;

            match ledger_info {
                LedgerInfo::Request { raw } => self.apply_request(&raw, principals)?,
                LedgerInfo::PrePrepare(info) => {
                    let expected = self.last_executed.next();
                    if info.seqno != expected {
                        return Err(ReplayError::SequenceViolation {
                            expected,
                            found: info.seqno,
                        });
                    }

                    let num_requests = info.num_requests as usize;
                    if self.pending.len() < num_requests {
                        return Err(ReplayError::MissingRequests {
                            seqno: info.seqno,
                            expected: info.num_requests,
                            pending: self.pending.len(),
                        });
                    }
                    let batch: Vec<Request> = self.pending.drain(..num_requests).collect();

                    let executed_before = self.total_requests_executed;
                    self.total_requests_executed += batch.len() as u64;
                    self.last_executed = info.seqno;
                    batches.push((info, batch, executed_before));
                }
            }
        }

        // The executor only sees entries whose records are all acceptable.
        if let Some(executor) = executor {
            for (info, batch, executed_before) in &batches {
                let (byz_info, _) = execute_batch(
                    &mut *executor,
                    info.seqno,
                    batch.iter(),
                    &info.non_determinism,
                    *executed_before,
                )?;
                check_roots(
                    info.seqno,
                    info.full_state_merkle_root,
                    info.replicated_state_merkle_root,
                    &byz_info,
                )?;
            }
        }
        Ok(!batches.is_empty())
    }

    fn apply_request(&mut self, raw: &[u8], principals: Option<&PrincipalSet>) -> Result<(), ReplayError> {
        let request = Request::from_bytes(raw).map_err(|source| ReplayError::MalformedRequest { source })?;
        let client = request.client_id();
        request
            .verify(principals.and_then(|principals| principals.verifying_key(&client)), false)
            .map_err(|source| ReplayError::MalformedRequest { source })?;

        if let Some(last) = self.last_request_ids.get(&client) {
            if request.request_id() <= *last {
                return Err(ReplayError::DuplicateRequest {
                    client,
                    request_id: request.request_id(),
                });
            }
        }
        self.last_request_ids.insert(client, request.request_id());
        self.pending.push_back(request);
        Ok(())
    }
}

/// Reasons why an entry of a ledger stream is rejected.
#[derive(Debug)]
pub enum ReplayError {
    /// The entry is not a serialized transaction.
    Decode { source: std::io::Error },
    /// The entry is not newer than the store.
    StaleVersion { current: Version, entry: Version },
    KVGetError(KVGetError),
    /// A ledger info record could not be decoded.
    MalformedLedgerInfo { source: std::io::Error },
    /// The entry removes the ledger info record.
    LedgerInfoRemoved,
    /// A request record does not decode or fails authentication.
    MalformedRequest { source: AuthError },
    /// A request record repeats (or precedes) a request already replayed for the same client.
    DuplicateRequest { client: ClientId, request_id: RequestId },
    /// A pre-prepare record is out of sequence.
    SequenceViolation { expected: SeqNo, found: SeqNo },
    /// A pre-prepare record claims more requests than have been replayed.
    MissingRequests {
        seqno: SeqNo,
        expected: u32,
        pending: usize,
    },
    ExecutionFault(ExecutionFault),
}

impl From<KVGetError> for ReplayError {
    fn from(value: KVGetError) -> Self {
        ReplayError::KVGetError(value)
    }
}

impl From<ExecutionFault> for ReplayError {
    fn from(value: ExecutionFault) -> Self {
        ReplayError::ExecutionFault(value)
    }
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::Decode { source } => write!(f, "entry cannot be decoded: {}", source),
            ReplayError::StaleVersion { current, entry } => write!(
                f,
                "entry has version {}, but the store is already at version {}",
                entry, current
            ),
            ReplayError::KVGetError(err) => write!(f, "{}", err),
            ReplayError::MalformedLedgerInfo { source } => {
                write!(f, "ledger info record cannot be decoded: {}", source)
            }
            ReplayError::LedgerInfoRemoved => write!(f, "entry removes the ledger info record"),
            ReplayError::MalformedRequest { source } => write!(f, "request record is invalid: {}", source),
            ReplayError::DuplicateRequest { client, request_id } => write!(
                f,
                "request {} from client {} was already replayed",
                request_id, client
            ),
            ReplayError::SequenceViolation { expected, found } => {
                write!(f, "pre-prepare has seqno {}, expected {}", found, expected)
            }
            ReplayError::MissingRequests {
                seqno,
                expected,
                pending,
            } => write!(
                f,
                "pre-prepare at seqno {} has {} requests, but only {} are pending",
                seqno, expected, pending
            ),
            ReplayError::ExecutionFault(fault) => write!(f, "{}", fault),
        }
    }
}

impl std::error::Error for ReplayError {}
