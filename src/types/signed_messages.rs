/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed messages, votes and aggregates of votes.

use ed25519_dalek::VerifyingKey;

use super::{
    basic::{CryptoHash, SeqNo, SignatureBytes, ViewNumber},
    crypto_primitives::verify_signature,
    principals::PrincipalSet,
};

/// A message that carries its sender's signature.
pub trait SignedMessage: Clone {
    /// The bytes the signature is computed over.
    fn message_bytes(&self) -> Vec<u8>;

    fn signature_bytes(&self) -> SignatureBytes;

    fn is_correct(&self, verifying_key: &VerifyingKey) -> bool {
        verify_signature(verifying_key, &self.message_bytes(), &self.signature_bytes())
    }
}

/// Data types that indicate that a replica supports a particular batch, identified by its `digest`, at a
/// particular `view` and `seqno`.
pub trait Vote: SignedMessage {
    fn view(&self) -> ViewNumber;

    fn seqno(&self) -> SeqNo;

    fn digest(&self) -> CryptoHash;
}

/// Data types that aggregate multiple [`Vote`]s of the same type into evidence that a quorum of replicas
/// in a [`PrincipalSet`] supports a particular batch.
pub trait Certificate {
    /// The specific `Vote` type that this `Certificate` aggregates into one value.
    type Vote: Vote;

    /// Check whether the certificate is correctly signed by at least [`quorum`](Certificate::quorum)
    /// replicas in `principals`.
    fn is_correct(&self, principals: &PrincipalSet) -> bool;

    /// The number of distinct replica signatures a correct certificate carries, given `principals`.
    fn quorum(principals: &PrincipalSet) -> usize;
}
