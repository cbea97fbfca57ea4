/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface between the ordering kernel and the application that executes requests.
//!
//! Applications implement [`Executor`]. The [replica](crate::replica::Replica) calls
//! [`exec_command`](Executor::exec_command) once per request, in sequence number order and in the order
//! of requests within a batch, threading a single [`ByzInfo`] through every request in the batch. After
//! the last request, the `ByzInfo` holds the batch's merkle roots and ctx, which are recorded in its
//! [pre-prepare](crate::pbft::pre_prepare::PrePrepare).
//!
//! ## Determinism
//!
//! Implementations of `exec_command` must be deterministic: every correct replica calls it with the same
//! arguments, including the same non-determinism buffer, and must obtain the same `ByzInfo`. A replica
//! that computes a different full state merkle root than the primary reports an [`ExecutionFault`].

use std::{
    collections::{btree_map, btree_set, BTreeMap, BTreeSet},
    fmt,
};

use crate::ledger::store::Table;
use crate::types::{
    basic::{ClientId, Ctx, MerkleRoot, RequestId, SeqNo},
    request::Request,
};

/// Status returned by [`Executor::exec_command`] when a request executed successfully.
pub const EXEC_OK: i32 = 0;

pub trait Executor {
    /// Execute a single request, writing the reply into `reply` and accumulating the batch's execution
    /// result into `info`. Returns [`EXEC_OK`] on success; any other value is an application-level
    /// failure, which the replica surfaces as an [`ExecutionFault`] without retrying.
    fn exec_command(&mut self, request: ExecRequest<'_>, reply: &mut Vec<u8>, info: &mut ByzInfo) -> i32;
}

/// The inputs of a single call to [`Executor::exec_command`].
#[derive(Clone, Copy, Debug)]
pub struct ExecRequest<'a> {
    pub payload: &'a [u8],
    /// Values agreed for the batch by the primary (e.g., a clock reading). Identical on every replica.
    pub non_determinism: &'a [u8],
    pub client_id: ClientId,
    pub request_id: RequestId,
    pub read_only: bool,
    /// Number of requests executed before this one, across all batches.
    pub total_requests_executed: u64,
}

/// Result of executing a batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByzInfo {
    pub ctx: Ctx,
    /// Digest of the complete application state.
    pub full_state_merkle_root: MerkleRoot,
    /// Digest of the replicated subset of the application state.
    pub replicated_state_merkle_root: MerkleRoot,
    /// Writes to derived tables, applied in the same transaction that records the batch in the ledger.
    pub app_state_updates: AppStateUpdates,
}

/// Set of key-value updates to derived tables, committed when the batch that produced them is written to
/// the ledger.
///
/// Updates are kept ordered by table and key so that every replica writes them in the same order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppStateUpdates {
    inserts: BTreeMap<(Table, Vec<u8>), Vec<u8>>,
    deletes: BTreeSet<(Table, Vec<u8>)>,
}

impl AppStateUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule the insertion of `key` -> `value` into `table`. Cancels a scheduled deletion of `key`.
    pub fn insert(&mut self, table: &Table, key: Vec<u8>, value: Vec<u8>) {
        let entry = (table.clone(), key);
        self.deletes.remove(&entry);
        self.inserts.insert(entry, value);
    }

    /// Schedule the deletion of `key` from `table`. Cancels a scheduled insertion of `key`.
    pub fn delete(&mut self, table: &Table, key: Vec<u8>) {
        let entry = (table.clone(), key);
        self.inserts.remove(&entry);
        self.deletes.insert(entry);
    }

    pub fn get_insert(&self, table: &Table, key: &[u8]) -> Option<&Vec<u8>> {
        self.inserts.get(&(table.clone(), key.to_vec()))
    }

    pub fn contains_delete(&self, table: &Table, key: &[u8]) -> bool {
        self.deletes.contains(&(table.clone(), key.to_vec()))
    }

    pub fn inserts(&self) -> btree_map::Iter<'_, (Table, Vec<u8>), Vec<u8>> {
        self.inserts.iter()
    }

    pub fn deletes(&self) -> btree_set::Iter<'_, (Table, Vec<u8>)> {
        self.deletes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

/// Execution results that the replica cannot reconcile. These are fatal: the replica stops making
/// progress on the affected sequence number and reports the fault to its host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFault {
    /// The executor returned a non-zero status for a request.
    NonZeroStatus {
        seqno: SeqNo,
        client: ClientId,
        request_id: RequestId,
        status: i32,
    },
    /// Executing the batch produced a different full state merkle root than the one recorded for it.
    RootDivergence {
        seqno: SeqNo,
        expected: MerkleRoot,
        computed: MerkleRoot,
    },
    /// The full state merkle roots matched, but the replicated state merkle roots did not.
    ReplicatedRootDivergence {
        seqno: SeqNo,
        expected: MerkleRoot,
        computed: MerkleRoot,
    },
}

impl fmt::Display for ExecutionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionFault::NonZeroStatus {
                seqno,
                client,
                request_id,
                status,
            } => write!(
                f,
                "request {} from client {} in seqno {} failed with status {}",
                request_id, client, seqno, status
            ),
            ExecutionFault::RootDivergence {
                seqno,
                expected,
                computed,
            } => write!(
                f,
                "executing seqno {} produced full state root {}, expected {}",
                seqno, computed, expected
            ),
            ExecutionFault::ReplicatedRootDivergence {
                seqno,
                expected,
                computed,
            } => write!(
                f,
                "executing seqno {} produced replicated state root {}, expected {}",
                seqno, computed, expected
            ),
        }
    }
}

impl std::error::Error for ExecutionFault {}

/// Execute `requests` as the batch at `seqno`, returning the batch's [`ByzInfo`] and the number of
/// requests executed. `total_requests_executed` is the count before the batch.
pub(crate) fn execute_batch<'r, E: Executor + ?Sized>(
    executor: &mut E,
    seqno: SeqNo,
    requests: impl Iterator<Item = &'r Request>,
    non_determinism: &[u8],
    total_requests_executed: u64,
) -> Result<(ByzInfo, u64), ExecutionFault> {
    let mut info = ByzInfo::default();
    let mut executed = 0;
    for request in requests {
        let mut reply = Vec::new();
        let status = executor.exec_command(
            ExecRequest {
                payload: request.payload(),
                non_determinism,
                client_id: request.client_id(),
                request_id: request.request_id(),
                read_only: request.is_read_only(),
                total_requests_executed: total_requests_executed + executed,
            },
            &mut reply,
            &mut info,
        );
        if status != EXEC_OK {
            return Err(ExecutionFault::NonZeroStatus {
                seqno,
                client: request.client_id(),
                request_id: request.request_id(),
                status,
            });
        }
        executed += 1;
    }
    Ok((info, executed))
}

/// Compare the roots that executing the batch at `seqno` produced against the roots `expected` for it,
/// full state root first.
pub(crate) fn check_roots(
    seqno: SeqNo,
    expected_full: MerkleRoot,
    expected_replicated: MerkleRoot,
    computed: &ByzInfo,
) -> Result<(), ExecutionFault> {
    if computed.full_state_merkle_root != expected_full {
        return Err(ExecutionFault::RootDivergence {
            seqno,
            expected: expected_full,
            computed: computed.full_state_merkle_root,
        });
    }
    if computed.replicated_state_merkle_root != expected_replicated {
        return Err(ExecutionFault::ReplicatedRootDivergence {
            seqno,
            expected: expected_replicated,
            computed: computed.replicated_state_merkle_root,
        });
    }
    Ok(())
}
