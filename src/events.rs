/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the events that a replica emits for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published on a
//! channel to the [event bus](crate::event_bus), which runs the handlers registered through
//! [`ReplicaSpec`](crate::replica::ReplicaSpec) and, if enabled, the [default loggers](crate::logging).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::ledger::{replay::DeserialiseSuccess, store::Version};
use crate::pbft::{
    messages::{Commit, Prepare},
    types::{CommitCertificate, PrepareCertificate, ProtocolViolation},
};
use crate::types::basic::{ClientId, CryptoHash, Ctx, MerkleRoot, PrincipalId, RequestId, SeqNo, ViewNumber};

pub enum Event {
    // Events that involve requests.
    ReceiveRequest(ReceiveRequestEvent),
    // Events that involve sending a protocol message.
    Propose(ProposeEvent),
    Prepare(PrepareEvent),
    Commit(CommitEvent),
    // Events that involve receiving a protocol message.
    ReceivePrePrepare(ReceivePrePrepareEvent),
    ReceivePrepare(ReceivePrepareEvent),
    ReceiveCommit(ReceiveCommitEvent),
    // Certification events.
    CollectPrepareCertificate(CollectPrepareCertificateEvent),
    CollectCommitCertificate(CollectCommitCertificateEvent),
    // Events that change application or ledger state.
    TentativeExecute(TentativeExecuteEvent),
    Execute(ExecuteEvent),
    ReplayEntry(ReplayEntryEvent),
    // Misbehavior.
    ProtocolViolation(ProtocolViolationEvent),
    ViewChangeSuggested(ViewChangeSuggestedEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            if event_publisher.send(event).is_err() {
                log::debug!("Event bus has stopped; event dropped");
            }
        }
    }
}

pub struct ReceiveRequestEvent {
    pub timestamp: SystemTime,
    pub origin: Option<PrincipalId>,
    pub client: ClientId,
    pub request_id: RequestId,
    pub digest: CryptoHash,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
    pub num_requests: u32,
}

pub struct PrepareEvent {
    pub timestamp: SystemTime,
    pub prepare: Prepare,
}

pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub commit: Commit,
}

pub struct ReceivePrePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
}

pub struct ReceivePrepareEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub prepare: Prepare,
}

pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: PrincipalId,
    pub commit: Commit,
}

pub struct CollectPrepareCertificateEvent {
    pub timestamp: SystemTime,
    pub certificate: PrepareCertificate,
}

pub struct CollectCommitCertificateEvent {
    pub timestamp: SystemTime,
    pub certificate: CommitCertificate,
}

pub struct TentativeExecuteEvent {
    pub timestamp: SystemTime,
    pub seqno: SeqNo,
    pub num_requests: u32,
    pub full_state_merkle_root: MerkleRoot,
    pub ctx: Ctx,
}

/// The batch at `seqno` was written to the ledger, producing store `version`.
pub struct ExecuteEvent {
    pub timestamp: SystemTime,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
    pub version: Version,
    pub certificate: CommitCertificate,
}

pub struct ReplayEntryEvent {
    pub timestamp: SystemTime,
    pub outcome: DeserialiseSuccess,
    pub last_executed: SeqNo,
}

pub struct ProtocolViolationEvent {
    pub timestamp: SystemTime,
    pub violation: ProtocolViolation,
}

pub struct ViewChangeSuggestedEvent {
    pub timestamp: SystemTime,
    pub view: ViewNumber,
    pub violations: u64,
}
