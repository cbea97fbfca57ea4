/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for pluggable peer-to-peer networking, and the [`Message`] type that
//! replicas exchange over it.
//!
//! Each principal is reachable by its [`PrincipalId`]. The transport may be as concurrent as it likes,
//! but the replica only touches it from its own protocol driver: every message it receives is funneled
//! through [`recv`](Network::recv) before it can affect protocol state.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::pbft::messages::{Commit, PbftMessage, Prepare, SignedPrePrepare};
use crate::types::{basic::PrincipalId, principals::PrincipalInfo, request::Request};

pub trait Network: Clone + Send + 'static {
    /// Informs the network provider of a principal that the replica may exchange messages with.
    fn add_principal(&mut self, principal: &PrincipalInfo);

    /// Send a message to every other replica without blocking.
    fn broadcast(&mut self, message: Message);

    /// Send a message to the specified principal without blocking.
    fn send(&mut self, peer: PrincipalId, message: Message);

    /// Receive a message from any principal. Returns immediately with a `None` if no message is
    /// available now.
    fn recv(&mut self) -> Option<(PrincipalId, Message)>;
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum Message {
    /// A client request, forwarded to (or between) replicas.
    Request(Request),
    Pbft(PbftMessage),
}

impl Message {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        self.try_to_vec().unwrap()
    }

    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Message> {
        Message::try_from_slice(bytes)
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<PbftMessage> for Message {
    fn from(message: PbftMessage) -> Self {
        Message::Pbft(message)
    }
}

impl From<SignedPrePrepare> for Message {
    fn from(pre_prepare: SignedPrePrepare) -> Self {
        Message::Pbft(PbftMessage::PrePrepare(pre_prepare))
    }
}

impl From<Prepare> for Message {
    fn from(prepare: Prepare) -> Self {
        Message::Pbft(PbftMessage::Prepare(prepare))
    }
}

impl From<Commit> for Message {
    fn from(commit: Commit) -> Self {
        Message::Pbft(PbftMessage::Commit(commit))
    }
}
