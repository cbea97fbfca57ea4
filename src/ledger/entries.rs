/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Records kept in the ledger info table.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::pbft::pre_prepare::PrePrepare;
use crate::types::{
    basic::{ClientId, Ctx, MerkleRoot, RequestId, SeqNo, ViewNumber},
    request::Request,
};

/// A unit of agreed history. Every transaction written by the
/// [`LedgerWriter`](super::writer::LedgerWriter) puts one `Request` record per request in a batch, followed
/// by one `PrePrepare` record for the batch itself.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum LedgerInfo {
    /// The canonical encoding of a trimmed [request](crate::types::request::Request).
    Request { raw: Vec<u8> },
    PrePrepare(PrePrepareInfo),
}

impl LedgerInfo {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        self.try_to_vec().unwrap()
    }

    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<LedgerInfo> {
        LedgerInfo::try_from_slice(bytes)
    }
}

/// Batch metadata of a finalized [`PrePrepare`]: everything except the requests themselves, which
/// precede it in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepareInfo {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub num_requests: u32,
    pub non_determinism: Vec<u8>,
    pub full_state_merkle_root: MerkleRoot,
    pub replicated_state_merkle_root: MerkleRoot,
    pub ctx: Ctx,
}

impl From<&PrePrepare> for PrePrepareInfo {
    fn from(pre_prepare: &PrePrepare) -> Self {
        PrePrepareInfo {
            view: pre_prepare.view(),
            seqno: pre_prepare.seqno(),
            num_requests: pre_prepare.num_requests(),
            non_determinism: pre_prepare.non_determinism().to_vec(),
            full_state_merkle_root: pre_prepare.full_state_merkle_root(),
            replicated_state_merkle_root: pre_prepare.replicated_state_merkle_root(),
            ctx: pre_prepare.ctx(),
        }
    }
}

/// How far the ledger has ordered each client's requests. Rewritten by every transaction that the
/// [`LedgerWriter`](super::writer::LedgerWriter) commits, so that a replica restarting from its store
/// knows which requests it must not order again.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OrderedRequests {
    pub total_requests_executed: u64,
    pub last_request_ids: BTreeMap<ClientId, RequestId>,
}

impl OrderedRequests {
    /// Account for `requests`, ordered in a batch after every request already recorded.
    pub fn record<'r>(&mut self, requests: impl IntoIterator<Item = &'r Request>) {
        for request in requests {
            self.total_requests_executed += 1;
            let last = self
                .last_request_ids
                .entry(request.client_id())
                .or_insert(request.request_id());
            *last = (*last).max(request.request_id());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        self.try_to_vec().unwrap()
    }

    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<OrderedRequests> {
        OrderedRequests::try_from_slice(bytes)
    }
}
