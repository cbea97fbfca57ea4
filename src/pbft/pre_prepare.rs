/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The batch of requests that a primary proposes for a sequence number.
//!
//! A `PrePrepare` goes through two stages:
//! 1. **Constructed**: [`new`](PrePrepare::new) takes a prefix of the [request queue](ReqQueue) and
//!    assigns it a view and sequence number. Its merkle roots and ctx are zero.
//! 2. **Finalized**: after the batch has been executed, [`set_merkle_roots_and_ctx`](PrePrepare::set_merkle_roots_and_ctx)
//!    records the result of execution. From then on the pre-prepare is immutable: it may be signed,
//!    broadcast, and written to the ledger.

use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::req_queue::ReqQueue;
use crate::types::{
    basic::{CryptoHash, Ctx, MerkleRoot, SeqNo, ViewNumber},
    crypto_primitives::hash,
    request::Request,
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrePrepare {
    view: ViewNumber,
    seqno: SeqNo,
    requests: Vec<Request>,
    non_determinism: Vec<u8>,
    full_state_merkle_root: MerkleRoot,
    replicated_state_merkle_root: MerkleRoot,
    ctx: Ctx,
    finalized: bool,
}

impl PrePrepare {
    /// Build a batch for `seqno` out of up to `max_requests` requests taken from the front of `queue`.
    /// Requests that do not fit stay in the queue. Every request taken is [trimmed](Request::trim).
    pub fn new(
        view: ViewNumber,
        seqno: SeqNo,
        queue: &mut ReqQueue,
        max_requests: usize,
    ) -> Result<PrePrepare, PrePrepareError> {
        if seqno == SeqNo::init() {
            return Err(PrePrepareError::ZeroSeqNo);
        }
        if queue.is_empty() || max_requests == 0 {
            return Err(PrePrepareError::EmptyBatch { seqno });
        }

        let mut requests = queue.take_prefix(max_requests);
        requests.iter_mut().for_each(Request::trim);

        Ok(PrePrepare {
            view,
            seqno,
            requests,
            non_determinism: Vec::new(),
            full_state_merkle_root: MerkleRoot::zero(),
            replicated_state_merkle_root: MerkleRoot::zero(),
            ctx: Ctx::default(),
            finalized: false,
        })
    }

    /// Attach the non-determinism agreed for this batch (e.g., the primary's clock reading), which is
    /// passed to the executor alongside every request in the batch.
    pub fn set_non_determinism(&mut self, non_determinism: Vec<u8>) -> Result<(), PrePrepareError> {
        if self.finalized {
            return Err(PrePrepareError::AlreadyFinalized { seqno: self.seqno });
        }
        self.non_determinism = non_determinism;
        Ok(())
    }

    /// Record the result of executing this batch, finalizing the pre-prepare. Can only be called once.
    pub fn set_merkle_roots_and_ctx(
        &mut self,
        full_state_merkle_root: MerkleRoot,
        replicated_state_merkle_root: MerkleRoot,
        ctx: Ctx,
    ) -> Result<(), PrePrepareError> {
        if self.finalized {
            return Err(PrePrepareError::AlreadyFinalized { seqno: self.seqno });
        }
        self.full_state_merkle_root = full_state_merkle_root;
        self.replicated_state_merkle_root = replicated_state_merkle_root;
        self.ctx = ctx;
        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Identifies the pre-prepare in votes. Covers the view, the sequence number, the digest of every
    /// request, the non-determinism, and the execution result.
    pub fn digest(&self) -> CryptoHash {
        let request_digests: Vec<[u8; 32]> = self.requests.iter().map(|request| request.digest().bytes()).collect();
        // Safety: serializing into a Vec<u8> cannot fail.
        let header = (
            self.view,
            self.seqno,
            request_digests,
            self.non_determinism.clone(),
            self.full_state_merkle_root,
            self.replicated_state_merkle_root,
            self.ctx,
        )
            .try_to_vec()
            .unwrap();
        hash(&[&header])
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn seqno(&self) -> SeqNo {
        self.seqno
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn num_requests(&self) -> u32 {
        self.requests.len() as u32
    }

    pub fn non_determinism(&self) -> &[u8] {
        &self.non_determinism
    }

    pub fn full_state_merkle_root(&self) -> MerkleRoot {
        self.full_state_merkle_root
    }

    pub fn replicated_state_merkle_root(&self) -> MerkleRoot {
        self.replicated_state_merkle_root
    }

    pub fn ctx(&self) -> Ctx {
        self.ctx
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PrePrepareError {
    /// Sequence numbers start at 1.
    ZeroSeqNo,
    /// There were no requests to put in the batch.
    EmptyBatch { seqno: SeqNo },
    AlreadyFinalized { seqno: SeqNo },
}

impl fmt::Display for PrePrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrePrepareError::ZeroSeqNo => write!(f, "pre-prepares cannot be assigned sequence number 0"),
            PrePrepareError::EmptyBatch { seqno } => {
                write!(f, "no requests available for the pre-prepare at seqno {}", seqno)
            }
            PrePrepareError::AlreadyFinalized { seqno } => {
                write!(f, "the pre-prepare at seqno {} is already finalized", seqno)
            }
        }
    }
}

impl std::error::Error for PrePrepareError {}
