use std::{
    sync::{mpsc, Arc, Barrier, Mutex},
    thread,
};

use borsh::BorshSerialize;
use log::LevelFilter;
use pbft_ledger::{
    execution::AppStateUpdates,
    ledger::{
        entries::{LedgerInfo, OrderedRequests},
        pluggables::{KVGet, KVStore, WriteBatch},
        replay::{DeserialiseSuccess, ReplayState},
        store::{CommitError, CommitSuccess, CommittedTransaction, Store, Table, Version},
        variables::{LEDGER_INFO_KEY, ORDERED_REQUESTS_KEY, PBFT_INFO, STORE_VERSION},
        writer::{LedgerWriteError, LedgerWriter},
    },
    pbft::pre_prepare::PrePrepare,
    req_queue::ReqQueue,
    types::{
        basic::{CryptoHash, Ctx, PrincipalId, RequestId, SeqNo, ViewNumber},
        request::Request,
    },
};

mod common;

use crate::common::{
    executor::KV_TABLE,
    logging::setup_logger,
    mem_db::{MemDB, MemDBSnapshot, MemWriteBatch},
};

/// A `MemDB` in which another writer can be made to commit between the moment a transaction begins and
/// the moment it commits.
#[derive(Clone)]
struct ContendedDB {
    inner: MemDB,
    contention: Arc<Mutex<Contention>>,
}

#[derive(Default)]
struct Contention {
    version_reads: usize,
    conflicts_left: usize,
}

impl ContendedDB {
    fn new() -> ContendedDB {
        ContendedDB {
            inner: MemDB::new(),
            contention: Arc::new(Mutex::new(Contention::default())),
        }
    }

    // Make each of the next `conflicts` transactions find, when it commits, that another transaction
    // committed after it began. A transaction reads the store version once when it begins and once when it
    // commits.
    fn contend(&self, conflicts: usize) {
        let mut contention = self.contention.lock().unwrap();
        contention.version_reads = 0;
        contention.conflicts_left = conflicts;
    }

    fn commit_concurrently(&self) {
        let version = self.inner.store_version().unwrap();
        let mut wb = MemWriteBatch::new();
        wb.set(&STORE_VERSION, &version.next().try_to_vec().unwrap());
        self.inner.clone().write(wb);
    }
}

impl KVStore for ContendedDB {
    type WriteBatch = MemWriteBatch;
    type Snapshot<'a> = MemDBSnapshot<'a>;

    fn write(&mut self, wb: Self::WriteBatch) {
        self.inner.write(wb)
    }

    fn clear(&mut self) {
        self.inner.clear()
    }

    fn snapshot<'b>(&'b self) -> MemDBSnapshot<'b> {
        self.inner.snapshot()
    }
}

impl KVGet for ContendedDB {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        if key == &STORE_VERSION[..] {
            let concurrent = {
                let mut contention = self.contention.lock().unwrap();
                contention.version_reads += 1;
                if contention.version_reads % 2 == 0 && contention.conflicts_left > 0 {
                    contention.conflicts_left -= 1;
                    true
                } else {
                    false
                }
            };
            if concurrent {
                self.commit_concurrently();
            }
        }
        self.inner.get(key)
    }
}

fn finalized_pre_prepare(seqno: u64, request_ids: impl Iterator<Item = u64>) -> PrePrepare {
    let mut queue = ReqQueue::new();
    for request_id in request_ids {
        let mut request = Request::new(PrincipalId::new(100), RequestId::new(request_id), false, b"payload".to_vec());
        request.authenticate(None).unwrap();
        queue.append(request).unwrap();
    }
    let mut pre_prepare = PrePrepare::new(ViewNumber::init(), SeqNo::new(seqno), &mut queue, usize::MAX).unwrap();
    pre_prepare
        .set_merkle_roots_and_ctx(CryptoHash::new([seqno as u8; 32]), CryptoHash::zero(), Ctx::new(seqno as i64))
        .unwrap();
    pre_prepare
}

#[test]
fn transaction_test() {
    setup_logger(LevelFilter::Debug);

    let accounts = Table::replicated("accounts");
    let store = Store::new(MemDB::new()).with_table(accounts.clone());
    store.reset();
    assert_eq!(store.version().unwrap(), Version::init());

    // 1. A view observes its transaction's own writes before they are committed.
    let mut tx = store.tx().unwrap();
    {
        let mut view = tx.get_view(&accounts);
        view.put(b"alice", b"10");
        view.put(b"bob", b"20");
        assert_eq!(view.get(b"alice"), Some(b"10".to_vec()));
        view.put(b"alice", b"15");
        view.remove(b"bob");
        assert_eq!(view.get(b"alice"), Some(b"15".to_vec()));
        assert_eq!(view.get(b"bob"), None);
    }
    assert_eq!(store.get(&accounts, b"alice"), None);
    assert_eq!(tx.commit().unwrap(), CommitSuccess::Ok { version: Version::new(1) });
    assert_eq!(store.get(&accounts, b"alice"), Some(b"15".to_vec()));
    assert_eq!(store.get(&accounts, b"bob"), None);

    // 2. Dropping a transaction discards its writes.
    {
        let mut tx = store.tx().unwrap();
        tx.get_view(&accounts).put(b"carol", b"30");
    }
    assert_eq!(store.get(&accounts, b"carol"), None);

    // 3. A transaction without writes commits without changing the version.
    assert_eq!(
        store.tx().unwrap().commit().unwrap(),
        CommitSuccess::Empty { version: Version::new(1) }
    );

    // 4. Of two transactions begun at the same version, only the first to commit succeeds.
    let mut first = store.tx().unwrap();
    let mut second = store.tx().unwrap();
    first.get_view(&accounts).put(b"alice", b"5");
    second.get_view(&accounts).put(b"alice", b"25");
    assert_eq!(first.commit().unwrap().version(), Version::new(2));
    assert!(matches!(
        second.commit(),
        Err(CommitError::Conflict { expected, found }) if expected == Version::new(1) && found == Version::new(2)
    ));
    assert_eq!(store.get(&accounts, b"alice"), Some(b"5".to_vec()));

    // 5. Writes to unregistered tables are rejected, together with the rest of the transaction.
    let mut tx = store.tx().unwrap();
    tx.get_view(&accounts).put(b"dave", b"40");
    tx.get_view(&Table::derived("unregistered")).put(b"key", b"value");
    assert!(matches!(
        tx.commit(),
        Err(CommitError::UnknownTable { table }) if table == "unregistered"
    ));
    assert_eq!(store.get(&accounts, b"dave"), None);
    assert_eq!(store.version().unwrap(), Version::new(2));
}

#[test]
fn ledger_stream_test() {
    setup_logger(LevelFilter::Debug);

    let accounts = Table::replicated("accounts");
    let kv = Table::derived(KV_TABLE);
    let (ledger_stream, captured) = mpsc::channel();
    let store = Store::new(MemDB::new())
        .with_table(accounts.clone())
        .with_table(kv.clone())
        .with_replication(ledger_stream);

    let mut tx = store.tx().unwrap();
    tx.get_view(&accounts).put(b"alice", b"10");
    tx.get_view(&kv).put(b"cache", b"warm");
    tx.get_view(&accounts).remove(b"bob");
    tx.commit().unwrap();
    store.tx().unwrap().commit().unwrap();

    // 1. Only transactions with writes are streamed, with their writes in order.
    let entries: Vec<Vec<u8>> = captured.try_iter().collect();
    assert_eq!(entries.len(), 1);
    let committed = CommittedTransaction::from_bytes(&entries[0]).unwrap();
    assert_eq!(committed.version, Version::new(1));
    let writes: Vec<(&str, &[u8], Option<&[u8]>)> = committed
        .writes
        .iter()
        .map(|write| (write.table.as_str(), write.key.as_slice(), write.value.as_deref()))
        .collect();
    assert_eq!(
        writes,
        vec![
            ("accounts", &b"alice"[..], Some(&b"10"[..])),
            (KV_TABLE, &b"cache"[..], Some(&b"warm"[..])),
            ("accounts", &b"bob"[..], None),
        ]
    );

    // 2. Replaying the entry restores replicated tables registered with the target store, and nothing else.
    let target = Store::new(MemDB::new()).with_table(accounts.clone()).with_table(kv.clone());
    let mut replay_state = ReplayState::new();
    assert_eq!(
        replay_state.deserialise(&target, &entries[0], None, None),
        DeserialiseSuccess::Pass
    );
    assert_eq!(target.get(&accounts, b"alice"), Some(b"10".to_vec()));
    assert_eq!(target.get(&kv, b"cache"), None);
    assert_eq!(target.version().unwrap(), Version::new(1));
    assert_eq!(replay_state.last_executed(), SeqNo::init());

    let unaware = Store::new(MemDB::new());
    assert_eq!(
        ReplayState::new().deserialise(&unaware, &entries[0], None, None),
        DeserialiseSuccess::Pass
    );
    assert_eq!(unaware.get(&accounts, b"alice"), None);
    assert_eq!(unaware.version().unwrap(), Version::new(1));
}

#[test]
fn ledger_writer_test() {
    setup_logger(LevelFilter::Debug);

    let kv = Table::derived(KV_TABLE);
    let (ledger_stream, captured) = mpsc::channel();
    let store = Store::new(MemDB::new()).with_table(kv.clone()).with_replication(ledger_stream);
    let writer = LedgerWriter::new(&store, 0);

    // 1. Only finalized pre-prepares can be written.
    let mut queue = ReqQueue::new();
    let mut request = Request::new(PrincipalId::new(100), RequestId::new(1), false, b"payload".to_vec());
    request.authenticate(None).unwrap();
    queue.append(request).unwrap();
    let unfinalized = PrePrepare::new(ViewNumber::init(), SeqNo::new(1), &mut queue, 1).unwrap();
    assert!(matches!(
        writer.write_pre_prepare(&unfinalized),
        Err(LedgerWriteError::NotFinalized { seqno }) if seqno == SeqNo::new(1)
    ));
    assert_eq!(store.ledger_info().unwrap(), None);

    // 2. A batch is written as its requests, then the pre-prepare, then the record of ordered requests, then
    // its derived writes.
    let first = finalized_pre_prepare(1, 1..=3);
    let mut app_state_updates = AppStateUpdates::new();
    app_state_updates.insert(&kv, b"key1".to_vec(), b"value1".to_vec());
    app_state_updates.insert(&kv, b"key2".to_vec(), b"value2".to_vec());
    assert_eq!(
        writer
            .write_pre_prepare_with_app_state(&first, &app_state_updates)
            .unwrap()
            .version(),
        Version::new(1)
    );

    let entry = CommittedTransaction::from_bytes(&captured.try_recv().unwrap()).unwrap();
    assert_eq!(entry.writes.len(), 7);
    let records: Vec<LedgerInfo> = entry.writes[..4]
        .iter()
        .map(|write| {
            assert_eq!(write.table, PBFT_INFO);
            assert_eq!(write.key, LEDGER_INFO_KEY.to_vec());
            LedgerInfo::from_bytes(write.value.as_ref().unwrap()).unwrap()
        })
        .collect();
    for (record, request) in records.iter().zip(first.requests()) {
        assert_eq!(record, &LedgerInfo::Request { raw: request.to_bytes() });
    }
    match &records[3] {
        LedgerInfo::PrePrepare(info) => {
            assert_eq!(info.seqno, SeqNo::new(1));
            assert_eq!(info.num_requests, 3);
            assert_eq!(info.full_state_merkle_root, first.full_state_merkle_root());
            assert_eq!(info.ctx, Ctx::new(1));
        }
        other => panic!("expected a pre-prepare record, found {:?}", other),
    }
    assert_eq!(entry.writes[4].table, PBFT_INFO);
    assert_eq!(entry.writes[4].key, ORDERED_REQUESTS_KEY.to_vec());
    let ordered = OrderedRequests::from_bytes(entry.writes[4].value.as_ref().unwrap()).unwrap();
    assert_eq!(ordered.total_requests_executed, 3);
    assert_eq!(
        ordered.last_request_ids.into_iter().collect::<Vec<_>>(),
        vec![(PrincipalId::new(100), RequestId::new(3))]
    );
    assert_eq!(entry.writes[5].table, KV_TABLE);
    assert_eq!(entry.writes[5].key, b"key1".to_vec());
    assert_eq!(entry.writes[6].key, b"key2".to_vec());

    // The ledger info table holds only the latest record.
    assert_eq!(store.ledger_info().unwrap(), Some(records[3].clone()));
    assert_eq!(store.get(&kv, b"key2"), Some(b"value2".to_vec()));

    // 3. Derived deletions are written too.
    let mut app_state_updates = AppStateUpdates::new();
    app_state_updates.delete(&kv, b"key1".to_vec());
    writer
        .write_pre_prepare_with_app_state(&finalized_pre_prepare(2, 4..=4), &app_state_updates)
        .unwrap();
    assert_eq!(store.get(&kv, b"key1"), None);
    assert_eq!(store.get(&kv, b"key2"), Some(b"value2".to_vec()));
    assert_eq!(store.version().unwrap(), Version::new(2));

    // 4. The record of ordered requests accumulates across batches.
    let ordered = store.ordered_requests().unwrap().unwrap();
    assert_eq!(ordered.total_requests_executed, 4);
    assert_eq!(
        ordered.last_request_ids.get(&PrincipalId::new(100)),
        Some(&RequestId::new(4))
    );
}

#[test]
fn ledger_writer_retries_test() {
    setup_logger(LevelFilter::Debug);

    let db = ContendedDB::new();
    let store = Store::new(db.clone());
    let pre_prepare = finalized_pre_prepare(1, 1..=2);

    // 1. Conflicts are retried up to the configured number of times.
    db.contend(2);
    let success = LedgerWriter::new(&store, 2).write_pre_prepare(&pre_prepare).unwrap();
    assert_eq!(success, CommitSuccess::Ok { version: Version::new(3) });
    assert!(matches!(store.ledger_info().unwrap(), Some(LedgerInfo::PrePrepare(_))));

    // 2. A conflict that outlasts the retries is escalated, and nothing is written.
    let db = ContendedDB::new();
    let store = Store::new(db.clone());
    db.contend(2);
    assert!(matches!(
        LedgerWriter::new(&store, 1).write_pre_prepare(&pre_prepare),
        Err(LedgerWriteError::CommitFailed {
            attempts: 2,
            source: CommitError::Conflict { .. },
            ..
        })
    ));
    assert_eq!(store.ledger_info().unwrap(), None);
    assert_eq!(store.version().unwrap(), Version::new(2));
}

#[test]
fn concurrent_commits_test() {
    setup_logger(LevelFilter::Debug);

    const THREADS: usize = 8;
    let accounts = Table::replicated("accounts");
    let (ledger_stream, captured) = mpsc::channel();
    let store = Store::new(MemDB::new())
        .with_table(accounts.clone())
        .with_replication(ledger_stream);

    // 1. Every thread begins a transaction against version 0 before any of them commits. Exactly one
    // commit succeeds.
    let barrier = Barrier::new(THREADS);
    let results: Vec<Result<CommitSuccess, CommitError>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (store, accounts, barrier) = (&store, &accounts, &barrier);
                scope.spawn(move || {
                    let mut tx = store.tx().unwrap();
                    tx.get_view(accounts).put(b"owner", format!("thread {}", i).as_bytes());
                    barrier.wait();
                    tx.commit()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let winners: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, result)| result.is_ok())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(results[winners[0]].as_ref().unwrap().version(), Version::new(1));
    assert!(results
        .iter()
        .filter(|result| result.is_err())
        .all(|result| matches!(result, Err(CommitError::Conflict { .. }))));
    assert_eq!(store.version().unwrap(), Version::new(1));
    assert_eq!(
        store.get(&accounts, b"owner"),
        Some(format!("thread {}", winners[0]).into_bytes())
    );

    // 2. Threads that retry until they commit each get a version of their own, and the ledger stream
    // carries the transactions in version order.
    let versions: Vec<Version> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let (store, accounts) = (&store, &accounts);
                scope.spawn(move || loop {
                    let mut tx = store.tx().unwrap();
                    tx.get_view(accounts)
                        .put(format!("key{}", i).as_bytes(), b"value");
                    match tx.commit() {
                        Ok(success) => return success.version(),
                        Err(CommitError::Conflict { .. }) => thread::yield_now(),
                        Err(err) => panic!("unexpected commit error: {}", err),
                    }
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let mut sorted = versions.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted.len(), THREADS);
    assert_eq!(store.version().unwrap(), Version::new(THREADS as u64 + 1));
    for i in 0..THREADS {
        assert_eq!(store.get(&accounts, format!("key{}", i).as_bytes()), Some(b"value".to_vec()));
    }

    let streamed: Vec<Version> = captured
        .try_iter()
        .map(|entry| CommittedTransaction::from_bytes(&entry).unwrap().version)
        .collect();
    let expected: Vec<Version> = (1..=THREADS as u64 + 1).map(Version::new).collect();
    assert_eq!(streamed, expected);
}
