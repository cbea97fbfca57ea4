/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Client requests, as they are authenticated on intake, buffered in the
//! [request queue](crate::req_queue::ReqQueue), and ordered into
//! [pre-prepares](crate::pbft::pre_prepare::PrePrepare).
//!
//! ## Lifecycle
//!
//! 1. The client builds a [`Request`] and seals it with [`authenticate`](Request::authenticate), which
//!    computes its digest and, optionally, signs it.
//! 2. The receiving replica checks it with [`verify`](Request::verify) and attaches [`IntakeInfo`].
//! 3. Before inclusion in a batch, [`trim`](Request::trim) drops the intake-only fields. The borsh
//!    encoding of a trimmed request is its canonical wire encoding, and is what gets written to the
//!    ledger.

use std::{fmt, time::SystemTime};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{SigningKey, VerifyingKey};

use super::{
    basic::{ClientId, CryptoHash, PrincipalId, RequestId, SignatureBytes},
    crypto_primitives::{hash, verify_signature, Keypair},
};

/// Largest payload accepted on intake.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// An opaque client payload with the identifiers and authentication needed to order it.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Request {
    client_id: ClientId,
    request_id: RequestId,
    read_only: bool,
    payload: Vec<u8>,
    digest: CryptoHash,
    signature: Option<SignatureBytes>,
    #[borsh_skip]
    intake: Option<IntakeInfo>,
}

/// Scratch information recorded by the replica that received a request. Never part of the canonical
/// encoding.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct IntakeInfo {
    pub received_from: Option<PrincipalId>,
    pub received_at: Option<SystemTime>,
}

impl Request {
    /// Create an unauthenticated request. Call [`authenticate`](Self::authenticate) before submitting it.
    pub fn new(client_id: ClientId, request_id: RequestId, read_only: bool, payload: Vec<u8>) -> Request {
        Request {
            client_id,
            request_id,
            read_only,
            payload,
            digest: CryptoHash::zero(),
            signature: None,
            intake: None,
        }
    }

    /// Seal the request: compute its digest and, if `signer` is provided, sign the digest.
    ///
    /// Calling this again (e.g., after changing signers) replaces the previous digest and signature.
    pub fn authenticate(&mut self, signer: Option<&SigningKey>) -> Result<(), AuthError> {
        Self::check_payload(&self.payload)?;
        self.digest = self.compute_digest();
        self.signature = signer.map(|signing_key| Keypair::new(signing_key.clone()).sign(&self.digest.bytes()));
        Ok(())
    }

    /// Check the request's integrity and origin.
    ///
    /// The digest must match the request's contents. If the request is signed, the signature must verify
    /// against `client_key`. If `require_signature` is set, unsigned requests are rejected.
    pub fn verify(&self, client_key: Option<&VerifyingKey>, require_signature: bool) -> Result<(), AuthError> {
        Self::check_payload(&self.payload)?;
        if self.digest != self.compute_digest() {
            return Err(AuthError::DigestMismatch);
        }

        match (&self.signature, client_key) {
            (None, _) if require_signature => Err(AuthError::Unsigned),
            (None, _) => Ok(()),
            (Some(_), None) => Err(AuthError::UnknownClient { client: self.client_id }),
            (Some(signature), Some(key)) => {
                if verify_signature(key, &self.digest.bytes(), signature) {
                    Ok(())
                } else {
                    Err(AuthError::BadSignature)
                }
            }
        }
    }

    /// Drop the intake-only scratch fields, leaving the canonical form. Idempotent.
    pub fn trim(&mut self) {
        self.intake = None;
    }

    pub fn is_trimmed(&self) -> bool {
        self.intake.is_none()
    }

    pub(crate) fn set_intake(&mut self, intake: IntakeInfo) {
        self.intake = Some(intake);
    }

    pub fn intake(&self) -> Option<&IntakeInfo> {
        self.intake.as_ref()
    }

    /// The canonical wire encoding of the request. Scratch fields are never encoded.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        self.try_to_vec().unwrap()
    }

    /// Decode a request from its canonical wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Request, AuthError> {
        Request::try_from_slice(bytes).map_err(|err| AuthError::Malformed { source: err })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn digest(&self) -> CryptoHash {
        self.digest
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    fn compute_digest(&self) -> CryptoHash {
        hash(&[
            &self.client_id.int().to_le_bytes(),
            &self.request_id.int().to_le_bytes(),
            &[self.read_only as u8],
            &self.payload,
        ])
    }

    fn check_payload(payload: &[u8]) -> Result<(), AuthError> {
        if payload.is_empty() {
            Err(AuthError::EmptyPayload)
        } else if payload.len() > MAX_REQUEST_SIZE {
            Err(AuthError::PayloadTooLarge { size: payload.len() })
        } else {
            Ok(())
        }
    }
}

/// Reasons why a request is dropped on intake. Requests that fail authentication never enter the
/// request queue and cause no change in protocol state.
#[derive(Debug)]
pub enum AuthError {
    EmptyPayload,
    PayloadTooLarge { size: usize },
    /// The digest does not match the request's contents.
    DigestMismatch,
    /// A signature was required but the request is unsigned.
    Unsigned,
    BadSignature,
    /// The request is signed, but the signer is not a known principal.
    UnknownClient { client: ClientId },
    /// The bytes do not decode into a request.
    Malformed { source: std::io::Error },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::EmptyPayload => write!(f, "request payload is empty"),
            AuthError::PayloadTooLarge { size } => write!(
                f,
                "request payload of {} bytes exceeds the limit of {} bytes",
                size, MAX_REQUEST_SIZE
            ),
            AuthError::DigestMismatch => write!(f, "request digest does not match its contents"),
            AuthError::Unsigned => write!(f, "request is not signed"),
            AuthError::BadSignature => write!(f, "request signature does not verify"),
            AuthError::UnknownClient { client } => write!(f, "request signed by unknown client {}", client),
            AuthError::Malformed { source } => write!(f, "request cannot be decoded: {}", source),
        }
    }
}

impl std::error::Error for AuthError {}
