//! [`MockExecutor`], a deterministic implementation of [`Executor`] used in all of the integration tests.

use pbft_ledger::{
    execution::{ByzInfo, ExecRequest, Executor, EXEC_OK},
    ledger::store::Table,
    types::{
        basic::{CryptoHash, Ctx},
        crypto_primitives::hash,
    },
};

/// Name of the derived table that [`MockExecutor`] writes `key=value` payloads into.
pub(crate) const KV_TABLE: &str = "kv";

/// Status returned for a request whose payload is [`FAILING_PAYLOAD`].
pub(crate) const FAILED_STATUS: i32 = 7;

pub(crate) const FAILING_PAYLOAD: &[u8] = b"fail";

/// A deterministic executor whose state is a hash chain over every payload it has executed.
///
/// - The full state root after a request is `hash(previous root, payload)`.
/// - The replicated state root is `hash(full state root, "replicated")`.
/// - `ctx` is the number of requests executed so far, including the current one.
/// - A payload of the form `key=value` additionally writes `key -> value` into the derived [`KV_TABLE`].
///
/// Executors built with different seeds diverge on the first request they execute.
pub(crate) struct MockExecutor {
    root: CryptoHash,
    executed: Vec<Vec<u8>>,
}

impl MockExecutor {
    pub(crate) fn new() -> MockExecutor {
        MockExecutor::with_seed(0)
    }

    pub(crate) fn with_seed(seed: u64) -> MockExecutor {
        MockExecutor {
            root: hash(&[&seed.to_le_bytes()]),
            executed: Vec::new(),
        }
    }

    /// Payloads executed, in order.
    pub(crate) fn executed(&self) -> &[Vec<u8>] {
        &self.executed
    }

    pub(crate) fn root(&self) -> CryptoHash {
        self.root
    }
}

impl Executor for MockExecutor {
    fn exec_command(&mut self, request: ExecRequest<'_>, reply: &mut Vec<u8>, info: &mut ByzInfo) -> i32 {
        if request.payload == FAILING_PAYLOAD {
            return FAILED_STATUS;
        }

        self.root = hash(&[&self.root.bytes(), request.payload]);
        self.executed.push(request.payload.to_vec());

        info.full_state_merkle_root = self.root;
        info.replicated_state_merkle_root = hash(&[&self.root.bytes(), b"replicated"]);
        info.ctx = Ctx::new((request.total_requests_executed + 1) as i64);

        if let Some(pos) = request.payload.iter().position(|byte| *byte == b'=') {
            let (key, value) = (&request.payload[..pos], &request.payload[pos + 1..]);
            info.app_state_updates
                .insert(&Table::derived(KV_TABLE), key.to_vec(), value.to_vec());
        }

        reply.extend_from_slice(&self.root.bytes());
        EXEC_OK
    }
}
