/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types that are sent around and inspected, but have no active behavior.
//!
//! These types follow the newtype pattern, and the API for using them is defined in this module.

use borsh::{BorshDeserialize, BorshSerialize};
use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

/// Position of an agreed batch in the global, ledger-wide order of requests.
///
/// Sequence numbers start at 1. The value 0 is reserved to mean "nothing has been ordered yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct SeqNo(u64);

impl SeqNo {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    /// The sequence number before any batch has been ordered.
    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// The sequence number immediately after this one.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub const fn saturating_add(&self, rhs: u64) -> Self {
        Self(self.0.saturating_add(rhs))
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for SeqNo {
    type Output = SeqNo;
    fn add(self, rhs: u64) -> Self::Output {
        SeqNo::new(self.0 + rhs)
    }
}

impl AddAssign<u64> for SeqNo {
    fn add_assign(&mut self, rhs: u64) {
        self.0.add_assign(rhs)
    }
}

impl Sub<SeqNo> for SeqNo {
    type Output = u64;
    fn sub(self, rhs: SeqNo) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

/// A numbered epoch during which a fixed primary proposes the order of requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct ViewNumber(u64);

impl ViewNumber {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of a participant (replica or client), as assigned in the [node configuration](crate::types::principals::GeneralInfo).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct PrincipalId(u32);

impl PrincipalId {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for PrincipalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of the client that issued a request.
pub type ClientId = PrincipalId;

/// Per-client, monotonically increasing identifier of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Display for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Debug for CryptoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A 32-byte digest summarizing (some subset of) application state.
pub type MerkleRoot = CryptoHash;

/// Opaque value that correlates a batch with the application-level result of executing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, BorshDeserialize, BorshSerialize)]
pub struct Ctx(i64);

impl Ctx {
    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }
}

/// Bytes of an ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Signatures collected from the members of a [principal set](crate::types::principals::PrincipalSet),
/// indexed by each member's position in the set.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct SignatureSet(Vec<Option<SignatureBytes>>);

impl SignatureSet {
    pub fn new(len: usize) -> Self {
        Self(vec![None; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&SignatureBytes> {
        self.0.get(pos).and_then(Option::as_ref)
    }

    pub fn set(&mut self, pos: usize, signature: Option<SignatureBytes>) {
        self.0[pos] = signature
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Option<SignatureBytes>> {
        self.0.iter()
    }

    /// Number of positions that hold a signature.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|sig| sig.is_some()).count()
    }
}
