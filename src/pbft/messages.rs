/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between replicas as part of the ordering protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    basic::{CryptoHash, SeqNo, SignatureBytes, ViewNumber},
    crypto_primitives::{Keypair, SigningKey},
    signed_messages::{SignedMessage, Vote},
};

use super::{pre_prepare::PrePrepare, types::Phase};

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum PbftMessage {
    PrePrepare(SignedPrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

impl PbftMessage {
    pub fn view(&self) -> ViewNumber {
        match self {
            PbftMessage::PrePrepare(SignedPrePrepare { pre_prepare, .. }) => pre_prepare.view(),
            PbftMessage::Prepare(Prepare { view, .. }) => *view,
            PbftMessage::Commit(Commit { view, .. }) => *view,
        }
    }

    pub fn seqno(&self) -> SeqNo {
        match self {
            PbftMessage::PrePrepare(SignedPrePrepare { pre_prepare, .. }) => pre_prepare.seqno(),
            PbftMessage::Prepare(Prepare { seqno, .. }) => *seqno,
            PbftMessage::Commit(Commit { seqno, .. }) => *seqno,
        }
    }
}

impl From<SignedPrePrepare> for PbftMessage {
    fn from(pre_prepare: SignedPrePrepare) -> Self {
        PbftMessage::PrePrepare(pre_prepare)
    }
}

impl From<Prepare> for PbftMessage {
    fn from(prepare: Prepare) -> Self {
        PbftMessage::Prepare(prepare)
    }
}

impl From<Commit> for PbftMessage {
    fn from(commit: Commit) -> Self {
        PbftMessage::Commit(commit)
    }
}

/// Bytes that replicas sign to support the batch identified by `digest` at `view` and `seqno` in `phase`.
pub(crate) fn vote_message_bytes(view: ViewNumber, seqno: SeqNo, digest: CryptoHash, phase: Phase) -> Vec<u8> {
    // Safety: serializing into a Vec<u8> cannot fail.
    (view, seqno, digest, phase).try_to_vec().unwrap()
}

/// A finalized [`PrePrepare`], signed by the primary of its view.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct SignedPrePrepare {
    pub pre_prepare: PrePrepare,
    pub signature: SignatureBytes,
}

impl SignedPrePrepare {
    pub fn new(me: &SigningKey, pre_prepare: PrePrepare) -> SignedPrePrepare {
        let signature = Keypair::new(me.clone()).sign(&vote_message_bytes(
            pre_prepare.view(),
            pre_prepare.seqno(),
            pre_prepare.digest(),
            Phase::PrePrepare,
        ));
        SignedPrePrepare { pre_prepare, signature }
    }
}

impl SignedMessage for SignedPrePrepare {
    fn message_bytes(&self) -> Vec<u8> {
        vote_message_bytes(
            self.pre_prepare.view(),
            self.pre_prepare.seqno(),
            self.pre_prepare.digest(),
            Phase::PrePrepare,
        )
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

/// Sent by a backup once it has accepted and executed a pre-prepare.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
    pub signature: SignatureBytes,
}

impl Prepare {
    pub fn new(me: &SigningKey, view: ViewNumber, seqno: SeqNo, digest: CryptoHash) -> Prepare {
        let signature = Keypair::new(me.clone()).sign(&vote_message_bytes(view, seqno, digest, Phase::Prepare));
        Prepare {
            view,
            seqno,
            digest,
            signature,
        }
    }
}

impl SignedMessage for Prepare {
    fn message_bytes(&self) -> Vec<u8> {
        vote_message_bytes(self.view, self.seqno, self.digest, Phase::Prepare)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

impl Vote for Prepare {
    fn view(&self) -> ViewNumber {
        self.view
    }

    fn seqno(&self) -> SeqNo {
        self.seqno
    }

    fn digest(&self) -> CryptoHash {
        self.digest
    }
}

/// Sent by a replica once a batch is prepared locally.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub seqno: SeqNo,
    pub digest: CryptoHash,
    pub signature: SignatureBytes,
}

impl Commit {
    pub fn new(me: &SigningKey, view: ViewNumber, seqno: SeqNo, digest: CryptoHash) -> Commit {
        let signature = Keypair::new(me.clone()).sign(&vote_message_bytes(view, seqno, digest, Phase::Commit));
        Commit {
            view,
            seqno,
            digest,
            signature,
        }
    }
}

impl SignedMessage for Commit {
    fn message_bytes(&self) -> Vec<u8> {
        vote_message_bytes(self.view, self.seqno, self.digest, Phase::Commit)
    }

    fn signature_bytes(&self) -> SignatureBytes {
        self.signature
    }
}

impl Vote for Commit {
    fn view(&self) -> ViewNumber {
        self.view
    }

    fn seqno(&self) -> SeqNo {
        self.seqno
    }

    fn digest(&self) -> CryptoHash {
        self.digest
    }
}
