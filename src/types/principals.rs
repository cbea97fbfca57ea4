/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the participants of a cluster: [`PrincipalInfo`], the cluster-wide [`GeneralInfo`],
//! the per-node [`NodeInfo`], and the [`PrincipalSet`] that the protocol uses to check signatures and
//! count votes.

use std::{collections::HashMap, fmt, slice, time::Duration};

use ed25519_dalek::VerifyingKey;

use super::basic::{PrincipalId, ViewNumber};

/// Identity of a participant. Set at configuration time and immutable for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrincipalInfo {
    pub id: PrincipalId,
    pub port: u16,
    pub ip: String,
    /// Ed25519 public key used to verify the principal's signatures.
    pub pubk_sig: [u8; 32],
    /// Public key used for key agreement. Carried for the transport layer; unused by the core.
    pub pubk_enc: [u8; 32],
    pub host_name: String,
    /// `true` for replicas, `false` for clients.
    pub is_replica: bool,
}

/// Cluster-wide configuration, shared read-only by every replica.
#[derive(Clone, Debug)]
pub struct GeneralInfo {
    pub num_replicas: usize,
    pub num_clients: usize,
    /// `f`, the number of faulty replicas tolerated.
    pub max_faulty: usize,
    pub service_name: String,
    pub view_timeout: Duration,
    pub status_timeout: Duration,
    pub recovery_timeout: Duration,
    pub max_requests_between_signatures: u64,
    pub principal_info: Vec<PrincipalInfo>,
}

/// Configuration of a single node: its own identity, its network certificate, and the cluster-wide
/// [`GeneralInfo`].
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub own_info: PrincipalInfo,
    pub network_cert: Vec<u8>,
    pub general_info: GeneralInfo,
}

/// Reasons why a [`NodeInfo`] cannot be used to construct a replica.
#[derive(Debug)]
pub enum ConfigurationError {
    /// `num_replicas` must be at least `3 * max_faulty + 1`.
    TooFewReplicas { num_replicas: usize, max_faulty: usize },
    /// The number of replica principals listed does not match `num_replicas`.
    ReplicaCountMismatch { declared: usize, listed: usize },
    /// The node's own principal is not in the principal list.
    UnknownSelf { id: PrincipalId },
    /// The node's signing key does not match the public key listed for its own principal.
    OwnKeyMismatch { id: PrincipalId },
    /// Two principals share the same id.
    DuplicatePrincipal { id: PrincipalId },
    /// A principal's signing key could not be decoded.
    InvalidSigningKey { id: PrincipalId, source: ed25519_dalek::SignatureError },
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::TooFewReplicas { num_replicas, max_faulty } => write!(
                f,
                "{} replicas cannot tolerate {} faulty replicas (need at least {})",
                num_replicas,
                max_faulty,
                3 * max_faulty + 1
            ),
            ConfigurationError::ReplicaCountMismatch { declared, listed } => write!(
                f,
                "general info declares {} replicas but lists {}",
                declared, listed
            ),
            ConfigurationError::UnknownSelf { id } => {
                write!(f, "own principal {} is not in the principal list", id)
            }
            ConfigurationError::OwnKeyMismatch { id } => {
                write!(f, "signing key does not match the public key listed for principal {}", id)
            }
            ConfigurationError::DuplicatePrincipal { id } => {
                write!(f, "principal {} is listed more than once", id)
            }
            ConfigurationError::InvalidSigningKey { id, source } => {
                write!(f, "signing key of principal {} is invalid: {}", id, source)
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// Identities and verifying keys of every known principal, with the replicas kept in ascending order of
/// their ids.
///
/// The position of a replica in this order is the index used in [`SignatureSet`](super::basic::SignatureSet)s,
/// and determines which replica is the primary of a given view.
#[derive(Clone)]
pub struct PrincipalSet {
    // Ids of replicas, in ascending order.
    replicas: Vec<PrincipalId>,
    keys: HashMap<PrincipalId, VerifyingKey>,
    max_faulty: usize,
}

impl PrincipalSet {
    /// Build a principal set from the cluster configuration, validating it.
    pub fn from_general_info(general_info: &GeneralInfo) -> Result<PrincipalSet, ConfigurationError> {
        if general_info.num_replicas < 3 * general_info.max_faulty + 1 {
            return Err(ConfigurationError::TooFewReplicas {
                num_replicas: general_info.num_replicas,
                max_faulty: general_info.max_faulty,
            });
        }

        let mut principal_set = PrincipalSet {
            replicas: Vec::new(),
            keys: HashMap::new(),
            max_faulty: general_info.max_faulty,
        };
        for principal in &general_info.principal_info {
            principal_set.add(principal)?;
        }

        if principal_set.replicas.len() != general_info.num_replicas {
            return Err(ConfigurationError::ReplicaCountMismatch {
                declared: general_info.num_replicas,
                listed: principal_set.replicas.len(),
            });
        }

        Ok(principal_set)
    }

    /// Register a principal. Replicas are inserted into the replica order; clients only contribute their
    /// verifying key.
    pub fn add(&mut self, principal: &PrincipalInfo) -> Result<(), ConfigurationError> {
        if self.keys.contains_key(&principal.id) {
            return Err(ConfigurationError::DuplicatePrincipal { id: principal.id });
        }
        let key = VerifyingKey::from_bytes(&principal.pubk_sig).map_err(|source| {
            ConfigurationError::InvalidSigningKey {
                id: principal.id,
                source,
            }
        })?;

        if principal.is_replica {
            // Safety: `keys` has no entry for this id, so neither does `replicas`.
            let insert_pos = self.replicas.binary_search(&principal.id).unwrap_err();
            self.replicas.insert(insert_pos, principal.id);
        }
        self.keys.insert(principal.id, key);
        Ok(())
    }

    pub fn verifying_key(&self, principal: &PrincipalId) -> Option<&VerifyingKey> {
        self.keys.get(principal)
    }

    pub fn is_replica(&self, principal: &PrincipalId) -> bool {
        self.position(principal).is_some()
    }

    /// Get an iterator through the replicas' ids in ascending order.
    pub fn replicas(&self) -> slice::Iter<PrincipalId> {
        self.replicas.iter()
    }

    /// Number of replicas.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn position(&self, replica: &PrincipalId) -> Option<usize> {
        self.replicas.binary_search(replica).ok()
    }

    pub fn max_faulty(&self) -> usize {
        self.max_faulty
    }

    /// The replica that proposes the order of requests in `view`.
    pub fn primary(&self, view: ViewNumber) -> PrincipalId {
        self.replicas[(view.int() % self.replicas.len() as u64) as usize]
    }

    /// Number of matching prepares from distinct backups required for a batch to become prepared.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.max_faulty
    }

    /// Number of matching commits from distinct replicas required for a batch to become committed.
    pub fn commit_quorum(&self) -> usize {
        2 * self.max_faulty + 1
    }
}
