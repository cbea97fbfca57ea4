//! Helpers to configure, start and drive a cluster of replicas in a single thread.

use std::{sync::mpsc::Sender, time::Duration};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;

use pbft_ledger::{
    ledger::{
        pluggables::KVStore,
        store::{Store, Table},
    },
    networking::Network,
    replica::{Configuration, Replica},
    types::{
        basic::{PrincipalId, RequestId},
        principals::{GeneralInfo, NodeInfo, PrincipalInfo},
        request::Request,
    },
};

use super::{
    executor::{MockExecutor, KV_TABLE},
    mem_db::MemDB,
};

/// Id of the single client in every test cluster.
pub(crate) const CLIENT: PrincipalId = PrincipalId::new(100);

/// Keys and configuration shared by the replicas of a test cluster, plus one client.
pub(crate) struct TestCluster {
    pub(crate) replica_keys: Vec<SigningKey>,
    pub(crate) client_key: SigningKey,
    pub(crate) general_info: GeneralInfo,
}

impl TestCluster {
    /// Generate keys for `num_replicas` replicas, with ids `0..num_replicas`, tolerating `max_faulty`
    /// faults.
    pub(crate) fn new(num_replicas: usize, max_faulty: usize) -> TestCluster {
        let mut csprg = OsRng {};
        let replica_keys: Vec<SigningKey> = (0..num_replicas).map(|_| SigningKey::generate(&mut csprg)).collect();
        let client_key = SigningKey::generate(&mut csprg);

        let mut principals: Vec<PrincipalInfo> = replica_keys
            .iter()
            .enumerate()
            .map(|(id, key)| principal_info(PrincipalId::new(id as u32), key, true))
            .collect();
        principals.push(principal_info_for_client(&client_key));

        let general_info = GeneralInfo {
            num_replicas,
            num_clients: 1,
            max_faulty,
            service_name: String::from("pbft-ledger-test"),
            view_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_millis(100),
            recovery_timeout: Duration::from_secs(10),
            max_requests_between_signatures: 0,
            principal_info: principals,
        };

        TestCluster {
            replica_keys,
            client_key,
            general_info,
        }
    }

    pub(crate) fn replica_ids(&self) -> impl Iterator<Item = PrincipalId> {
        (0..self.replica_keys.len()).map(|id| PrincipalId::new(id as u32))
    }

    pub(crate) fn node_info(&self, id: PrincipalId) -> NodeInfo {
        let own_info = self
            .general_info
            .principal_info
            .iter()
            .find(|principal| principal.id == id)
            .cloned()
            .unwrap();
        NodeInfo {
            own_info,
            network_cert: Vec::new(),
            general_info: self.general_info.clone(),
        }
    }

    /// Configuration for the replica with id `id`, with generous limits.
    pub(crate) fn configuration(&self, id: PrincipalId) -> Configuration {
        Configuration::builder()
            .me(self.replica_keys[id.int() as usize].clone())
            .node_info(self.node_info(id))
            .max_batch_size(4)
            .max_requests_in_flight(64)
            .ledger_write_retries(3)
            .max_protocol_violations(10)
            .replay_reexecutes(true)
            .log_events(true)
            .build()
    }

    /// A request from the cluster's client, signed with the client's key.
    pub(crate) fn request(&self, request_id: u64, payload: &[u8]) -> Request {
        let mut request = Request::new(CLIENT, RequestId::new(request_id), false, payload.to_vec());
        request.authenticate(Some(&self.client_key)).unwrap();
        request
    }
}

fn principal_info(id: PrincipalId, key: &SigningKey, is_replica: bool) -> PrincipalInfo {
    PrincipalInfo {
        id,
        port: 3000 + id.int() as u16,
        ip: String::from("127.0.0.1"),
        pubk_sig: key.verifying_key().to_bytes(),
        pubk_enc: [0u8; 32],
        host_name: format!("principal-{}", id),
        is_replica,
    }
}

fn principal_info_for_client(key: &SigningKey) -> PrincipalInfo {
    principal_info(CLIENT, key, false)
}

/// A store over a fresh `MemDB`, with the executor's derived table registered.
pub(crate) fn test_store() -> Store<MemDB> {
    Store::new(MemDB::new()).with_table(Table::derived(KV_TABLE))
}

/// Like [`test_store`], but every committed transaction is also sent down `ledger_stream`.
pub(crate) fn replicating_test_store(ledger_stream: Sender<Vec<u8>>) -> Store<MemDB> {
    test_store().with_replication(ledger_stream)
}

/// Step every replica `rounds` times, in order of position.
pub(crate) fn drive<K, N>(replicas: &mut [Replica<'_, K, MockExecutor, N>], rounds: usize)
where
    K: KVStore,
    N: Network,
{
    for _ in 0..rounds {
        for replica in replicas.iter_mut() {
            replica.step().unwrap();
        }
    }
}
