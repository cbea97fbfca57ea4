/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of types specific to quorum certification: phases, certificates, the collector that
//! forms them, and the protocol violations that replicas detect along the way.

use std::{collections::HashMap, fmt};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{ClientId, CryptoHash, PrincipalId, RequestId, SeqNo, SignatureSet, ViewNumber},
    crypto_primitives::verify_signature,
    principals::PrincipalSet,
    request::AuthError,
    signed_messages::{Certificate, Vote},
};

use super::messages::{vote_message_bytes, Commit, Prepare};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, BorshSerialize, BorshDeserialize)]
pub enum Phase {
    PrePrepare,
    Prepare,
    Commit,
}

/// Proof that `2f` backups have accepted the pre-prepare identified by `digest` at `view` and `seqno`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrepareCertificate {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
    pub signatures: SignatureSet,
}

impl Certificate for PrepareCertificate {
    type Vote = Prepare;

    fn is_correct(&self, principals: &PrincipalSet) -> bool {
        // The primary vouches for its batch with the pre-prepare, not with a prepare.
        let primary = principals.primary(self.view);
        if let Some(primary_pos) = principals.position(&primary) {
            if self.signatures.get(primary_pos).is_some() {
                return false;
            }
        }

        match count_correct_signatures(
            self.view,
            self.seqno,
            self.digest,
            Phase::Prepare,
            &self.signatures,
            principals,
        ) {
            Some(count) => count >= Self::quorum(principals),
            None => false,
        }
    }

    fn quorum(principals: &PrincipalSet) -> usize {
        principals.prepare_quorum()
    }
}

/// Proof that `2f + 1` replicas have prepared the pre-prepare identified by `digest` at `view` and `seqno`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitCertificate {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
    pub signatures: SignatureSet,
}

impl Certificate for CommitCertificate {
    type Vote = Commit;

    fn is_correct(&self, principals: &PrincipalSet) -> bool {
        match count_correct_signatures(
            self.view,
            self.seqno,
            self.digest,
            Phase::Commit,
            &self.signatures,
            principals,
        ) {
            Some(count) => count >= Self::quorum(principals),
            None => false,
        }
    }

    fn quorum(principals: &PrincipalSet) -> usize {
        principals.commit_quorum()
    }
}

/// Count the signatures in `signatures`, checking each against the replica at the same position in
/// `principals`. Returns `None` if the set has the wrong size or contains an incorrect signature.
fn count_correct_signatures(
    view: ViewNumber,
    seqno: SeqNo,
    digest: CryptoHash,
    phase: Phase,
    signatures: &SignatureSet,
    principals: &PrincipalSet,
) -> Option<usize> {
    if signatures.len() != principals.len() {
        return None;
    }

    let message = vote_message_bytes(view, seqno, digest, phase);
    let mut count = 0;
    for (signature, signer) in signatures.iter().zip(principals.replicas()) {
        if let Some(signature) = signature {
            let verifying_key = principals.verifying_key(signer)?;
            if !verify_signature(verifying_key, &message, signature) {
                return None;
            }
            count += 1;
        }
    }
    Some(count)
}

/// Serves to incrementally form a certificate by combining votes of one phase, for one `view` and
/// `seqno`, from the replicas in a principal set.
///
/// Votes are kept per digest, so votes that arrive before the pre-prepare they support can be buffered
/// and counted once the pre-prepare is accepted.
#[derive(Clone)]
pub(crate) struct VoteCollector {
    view: ViewNumber,
    seqno: SeqNo,
    num_replicas: usize,
    signature_sets: HashMap<CryptoHash, SignatureSet>,
}

impl VoteCollector {
    pub(crate) fn new(view: ViewNumber, seqno: SeqNo, num_replicas: usize) -> Self {
        Self {
            view,
            seqno,
            num_replicas,
            signature_sets: HashMap::new(),
        }
    }

    /// Add the vote of the replica at position `pos`, returning the number of votes collected for the
    /// vote's digest.
    ///
    /// If the vote does not match the collector's view and seqno, or the replica already voted for
    /// the same digest, then this is a no-op.
    ///
    /// # Preconditions
    /// `vote.is_correct(signer)`, where `signer` is the replica at `pos`.
    pub(crate) fn collect<V: Vote>(&mut self, pos: usize, vote: &V) -> usize {
        if self.view != vote.view() || self.seqno != vote.seqno() || pos >= self.num_replicas {
            return 0;
        }

        let num_replicas = self.num_replicas;
        let signature_set = self
            .signature_sets
            .entry(vote.digest())
            .or_insert_with(|| SignatureSet::new(num_replicas));
        if signature_set.get(pos).is_none() {
            signature_set.set(pos, Some(vote.signature_bytes()));
        }
        signature_set.count()
    }

    /// Number of votes collected for `digest`.
    pub(crate) fn count(&self, digest: &CryptoHash) -> usize {
        self.signature_sets
            .get(digest)
            .map(SignatureSet::count)
            .unwrap_or(0)
    }

    pub(crate) fn signatures(&self, digest: &CryptoHash) -> SignatureSet {
        self.signature_sets
            .get(digest)
            .cloned()
            .unwrap_or_else(|| SignatureSet::new(self.num_replicas))
    }

    /// Drop every vote that does not support `digest`, returning the digest each dropped vote supported
    /// and the position of the replica that cast it.
    pub(crate) fn retain_only(&mut self, digest: &CryptoHash) -> Vec<(CryptoHash, usize)> {
        let mut dropped = Vec::new();
        self.signature_sets.retain(|collected_digest, signature_set| {
            if collected_digest == digest {
                return true;
            }
            for (pos, signature) in signature_set.iter().enumerate() {
                if signature.is_some() {
                    dropped.push((*collected_digest, pos));
                }
            }
            false
        });
        dropped
    }
}

/// Misbehavior observed in a message from a peer. The message is dropped and the replica's violation
/// counter goes up, but protocol state does not change.
#[derive(Debug)]
pub enum ProtocolViolation {
    /// The sender is not a replica.
    NotAReplica { origin: PrincipalId },
    /// The message is not correctly signed by its sender.
    BadSignature { origin: PrincipalId, seqno: SeqNo },
    WrongView {
        origin: PrincipalId,
        view: ViewNumber,
        expected: ViewNumber,
    },
    /// The sequence number is beyond the window of requests in flight.
    OutOfWindow { origin: PrincipalId, seqno: SeqNo },
    /// A pre-prepare was sent by a replica that is not the primary of its view.
    NotFromPrimary { origin: PrincipalId, seqno: SeqNo },
    /// The primary sent a different pre-prepare for a sequence number that already has one.
    ConflictingPrePrepare { origin: PrincipalId, seqno: SeqNo },
    /// The pre-prepare does not carry the result of executing it.
    NotFinalized { origin: PrincipalId, seqno: SeqNo },
    /// The pre-prepare has no requests.
    EmptyBatch { origin: PrincipalId, seqno: SeqNo },
    /// One of the requests in a pre-prepare fails authentication.
    InvalidRequest {
        origin: PrincipalId,
        seqno: SeqNo,
        source: AuthError,
    },
    /// A pre-prepare orders a request whose id is not greater than one already ordered for the same
    /// client, either by an earlier batch or earlier in the same batch.
    RepeatedRequest {
        origin: PrincipalId,
        seqno: SeqNo,
        client: ClientId,
        request_id: RequestId,
    },
    /// The primary sent a prepare for its own pre-prepare.
    PrepareFromPrimary { origin: PrincipalId, seqno: SeqNo },
    /// A vote does not match the digest of the pre-prepare accepted for its sequence number.
    VoteMismatch {
        origin: PrincipalId,
        seqno: SeqNo,
        phase: Phase,
        expected: CryptoHash,
        found: CryptoHash,
    },
}

impl ProtocolViolation {
    pub fn origin(&self) -> PrincipalId {
        match self {
            ProtocolViolation::NotAReplica { origin }
            | ProtocolViolation::BadSignature { origin, .. }
            | ProtocolViolation::WrongView { origin, .. }
            | ProtocolViolation::OutOfWindow { origin, .. }
            | ProtocolViolation::NotFromPrimary { origin, .. }
            | ProtocolViolation::ConflictingPrePrepare { origin, .. }
            | ProtocolViolation::NotFinalized { origin, .. }
            | ProtocolViolation::EmptyBatch { origin, .. }
            | ProtocolViolation::InvalidRequest { origin, .. }
            | ProtocolViolation::RepeatedRequest { origin, .. }
            | ProtocolViolation::PrepareFromPrimary { origin, .. }
            | ProtocolViolation::VoteMismatch { origin, .. } => *origin,
        }
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::NotAReplica { origin } => {
                write!(f, "principal {} is not a replica", origin)
            }
            ProtocolViolation::BadSignature { origin, seqno } => {
                write!(f, "message from {} for seqno {} is not correctly signed", origin, seqno)
            }
            ProtocolViolation::WrongView {
                origin,
                view,
                expected,
            } => write!(
                f,
                "message from {} is for view {}, but the current view is {}",
                origin, view, expected
            ),
            ProtocolViolation::OutOfWindow { origin, seqno } => {
                write!(f, "message from {} for seqno {} is outside the window", origin, seqno)
            }
            ProtocolViolation::NotFromPrimary { origin, seqno } => write!(
                f,
                "pre-prepare for seqno {} sent by {}, which is not the primary",
                seqno, origin
            ),
            ProtocolViolation::ConflictingPrePrepare { origin, seqno } => write!(
                f,
                "{} sent a conflicting pre-prepare for seqno {}",
                origin, seqno
            ),
            ProtocolViolation::NotFinalized { origin, seqno } => write!(
                f,
                "pre-prepare for seqno {} from {} does not carry execution results",
                seqno, origin
            ),
            ProtocolViolation::EmptyBatch { origin, seqno } => {
                write!(f, "pre-prepare for seqno {} from {} is empty", seqno, origin)
            }
            ProtocolViolation::InvalidRequest {
                origin,
                seqno,
                source,
            } => write!(
                f,
                "pre-prepare for seqno {} from {} carries an invalid request: {}",
                seqno, origin, source
            ),
            ProtocolViolation::RepeatedRequest {
                origin,
                seqno,
                client,
                request_id,
            } => write!(
                f,
                "pre-prepare for seqno {} from {} orders request {} from client {} out of order",
                seqno, origin, request_id, client
            ),
            ProtocolViolation::PrepareFromPrimary { origin, seqno } => {
                write!(f, "primary {} sent a prepare for seqno {}", origin, seqno)
            }
            ProtocolViolation::VoteMismatch {
                origin,
                seqno,
                phase,
                expected,
                found,
            } => write!(
                f,
                "{:?} vote from {} for seqno {} supports {}, but the accepted pre-prepare is {}",
                phase, origin, seqno, found, expected
            ),
        }
    }
}

impl std::error::Error for ProtocolViolation {}
