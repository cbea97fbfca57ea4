/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The store adaptor: named tables, scoped transactions, and the ledger stream.
//!
//! [`Store`] wraps a user-provided [`KVStore`] and is the only component that touches storage bytes.
//! Every change goes through a [`Tx`]:
//!
//! ```ignore
//! let mut tx = store.tx()?;
//! tx.get_view(&Table::pbft_info()).put(&LEDGER_INFO_KEY, &bytes);
//! tx.commit()?;
//! ```
//!
//! ## Tables
//!
//! Tables are registered with the store as either *replicated* or *derived*. Replicated tables (e.g., the
//! ledger info table) are part of the ledger and are restored by [`deserialise`](Store::deserialise).
//! Derived tables hold state computed by executing requests; their writes are recorded in the ledger
//! stream like any other write, but replay drops them.
//!
//! ## Ledger stream
//!
//! Each committed transaction is serialized as a [`CommittedTransaction`] and, if the store was built
//! [`with_replication`](Store::with_replication), sent down the replication channel. The sequence of
//! these byte strings is the ledger stream that [replay](super::replay) consumes.
//!
//! ## Concurrency
//!
//! A transaction records the store's [`Version`] when it begins. If another transaction commits first,
//! [`commit`](Tx::commit) fails with [`CommitError::Conflict`] and writes nothing; the caller retries
//! with a new transaction.
//!
//! Commits and [`deserialise`](Store::deserialise) hold the store's commit lock from the moment they read
//! the version until their writes (and ledger stream entry) are out. Two transactions begun against the
//! same version therefore never both commit, and the ledger stream is sent in version order.

use std::{
    collections::HashMap,
    fmt,
    sync::{mpsc::Sender, Mutex, MutexGuard, PoisonError},
};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{
    entries::{LedgerInfo, OrderedRequests},
    pluggables::{KVGetError, KVStore, WriteBatch},
    replay::ReplayError,
    variables::{self, table_key},
};

/// Number of transactions applied to a store. Increases by one per commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
pub struct Version(u64);

impl Version {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TableKind {
    Replicated,
    Derived,
}

/// A named key-value table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Table {
    name: String,
    kind: TableKind,
}

impl Table {
    pub fn replicated(name: impl Into<String>) -> Table {
        Table {
            name: name.into(),
            kind: TableKind::Replicated,
        }
    }

    pub fn derived(name: impl Into<String>) -> Table {
        Table {
            name: name.into(),
            kind: TableKind::Derived,
        }
    }

    /// The ledger info table.
    pub fn pbft_info() -> Table {
        Table::replicated(variables::PBFT_INFO)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }
}

/// A single write in a transaction. `value` is `None` for a removal.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TableWrite {
    pub table: String,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

/// An entry of the ledger stream: the writes of one committed transaction, in the order they were made.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommittedTransaction {
    pub version: Version,
    pub writes: Vec<TableWrite>,
}

impl CommittedTransaction {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Safety: serializing into a Vec<u8> cannot fail.
        self.try_to_vec().unwrap()
    }

    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<CommittedTransaction> {
        CommittedTransaction::try_from_slice(bytes)
    }
}

pub struct Store<K: KVStore> {
    kv_store: K,
    tables: HashMap<String, TableKind>,
    replication: Option<Sender<Vec<u8>>>,
    commit_lock: Mutex<()>,
}

impl<K: KVStore> Store<K> {
    /// Wrap `kv_store`. The ledger info table is registered automatically.
    pub fn new(kv_store: K) -> Store<K> {
        let mut tables = HashMap::new();
        tables.insert(variables::PBFT_INFO.to_string(), TableKind::Replicated);
        Store {
            kv_store,
            tables,
            replication: None,
            commit_lock: Mutex::new(()),
        }
    }

    /// Register `table`. Transactions may only write to registered tables.
    pub fn with_table(mut self, table: Table) -> Store<K> {
        self.tables.insert(table.name, table.kind);
        self
    }

    /// Send every committed transaction down `replication`.
    pub fn with_replication(mut self, replication: Sender<Vec<u8>>) -> Store<K> {
        self.replication = Some(replication);
        self
    }

    /// Begin a transaction against the current version of the store.
    pub fn tx(&self) -> Result<Tx<'_, K>, KVGetError> {
        Ok(Tx {
            store: self,
            base_version: self.version()?,
            writes: Vec::new(),
        })
    }

    pub fn version(&self) -> Result<Version, KVGetError> {
        self.kv_store.store_version()
    }

    /// Read the committed value of `key` in `table`.
    pub fn get(&self, table: &Table, key: &[u8]) -> Option<Vec<u8>> {
        self.kv_store.table_value(&table.name, key)
    }

    pub fn ledger_info(&self) -> Result<Option<LedgerInfo>, KVGetError> {
        self.kv_store.ledger_info()
    }

    /// Get the record of how far each client's requests have been ordered, if any batch was written.
    pub fn ordered_requests(&self) -> Result<Option<OrderedRequests>, KVGetError> {
        self.kv_store.ordered_requests()
    }

    pub fn is_registered(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn is_replicated(&self, table: &str) -> bool {
        self.tables.get(table) == Some(&TableKind::Replicated)
    }

    /// Get a read-only snapshot of the underlying key-value store.
    pub fn snapshot(&self) -> K::Snapshot<'_> {
        self.kv_store.snapshot()
    }

    /// Remove every key from the underlying key-value store, including the store version.
    pub fn reset(&self) {
        let _guard = self.lock_commits();
        self.kv_store.clone().clear()
    }

    // A panic while holding the lock leaves nothing half-written, since every write goes through a single
    // write batch.
    fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an entry of a ledger stream.
    ///
    /// The entry is decoded and its version checked against the store's: entries that are not newer than
    /// the store are rejected. Writes to tables that this store does not register as replicated are
    /// dropped. The remaining writes are passed, in order, to `hook`, and are applied atomically (together
    /// with the entry's version) only if `hook` returns `Ok`. If anything fails, the store is unchanged.
    pub fn deserialise<T, F>(&self, entry: &[u8], hook: F) -> Result<T, ReplayError>
    where
        F: FnOnce(Version, &[TableWrite]) -> Result<T, ReplayError>,
    {
        let committed = CommittedTransaction::from_bytes(entry).map_err(|source| ReplayError::Decode { source })?;

        let _guard = self.lock_commits();
        let current = self.version()?;
        if committed.version <= current {
            return Err(ReplayError::StaleVersion {
                current,
                entry: committed.version,
            });
        }

        let replicated: Vec<TableWrite> = committed
            .writes
            .into_iter()
            .filter(|write| self.is_replicated(&write.table))
            .collect();

        let result = hook(committed.version, &replicated)?;

        let mut wb = K::WriteBatch::new();
        stage_writes(&mut wb, &replicated);
        set_version(&mut wb, committed.version);
        self.kv_store.clone().write(wb);

        Ok(result)
    }
}

fn stage_writes<W: WriteBatch>(wb: &mut W, writes: &[TableWrite]) {
    for write in writes {
        let key = table_key(&write.table, &write.key);
        match &write.value {
            Some(value) => wb.set(&key, value),
            None => wb.delete(&key),
        }
    }
}

fn set_version<W: WriteBatch>(wb: &mut W, version: Version) {
    // Safety: serializing into a Vec<u8> cannot fail.
    wb.set(&variables::STORE_VERSION, &version.try_to_vec().unwrap())
}

/// A scoped transaction. Writes are buffered until [`commit`](Tx::commit); dropping the transaction
/// discards them.
pub struct Tx<'s, K: KVStore> {
    store: &'s Store<K>,
    base_version: Version,
    writes: Vec<TableWrite>,
}

impl<'s, K: KVStore> Tx<'s, K> {
    /// Get a view through which to read and write `table` in this transaction.
    pub fn get_view<'t>(&'t mut self, table: &Table) -> View<'t, 's, K> {
        View {
            tx: self,
            table: table.name.clone(),
        }
    }

    /// The store version this transaction was begun against.
    pub fn base_version(&self) -> Version {
        self.base_version
    }

    /// Atomically apply every write made in this transaction.
    pub fn commit(self) -> Result<CommitSuccess, CommitError> {
        let _guard = self.store.lock_commits();
        let found = self.store.version()?;
        if found != self.base_version {
            return Err(CommitError::Conflict {
                expected: self.base_version,
                found,
            });
        }

        if let Some(write) = self.writes.iter().find(|write| !self.store.is_registered(&write.table)) {
            return Err(CommitError::UnknownTable {
                table: write.table.clone(),
            });
        }

        if self.writes.is_empty() {
            return Ok(CommitSuccess::Empty { version: found });
        }

        let version = found.next();
        let mut wb = K::WriteBatch::new();
        stage_writes(&mut wb, &self.writes);
        set_version(&mut wb, version);
        self.store.kv_store.clone().write(wb);

        if let Some(replication) = &self.store.replication {
            let entry = CommittedTransaction {
                version,
                writes: self.writes,
            };
            if replication.send(entry.to_bytes()).is_err() {
                log::debug!("Ledger stream receiver dropped; transaction {} not streamed", version);
            }
        }

        Ok(CommitSuccess::Ok { version })
    }
}

/// A table as seen from inside a [`Tx`]: reads observe the transaction's own earlier writes.
pub struct View<'t, 's, K: KVStore> {
    tx: &'t mut Tx<'s, K>,
    table: String,
}

impl<'t, 's, K: KVStore> View<'t, 's, K> {
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self
            .tx
            .writes
            .iter()
            .rev()
            .find(|write| write.table == self.table && write.key == key)
        {
            Some(write) => write.value.clone(),
            None => self.tx.store.kv_store.table_value(&self.table, key),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.tx.writes.push(TableWrite {
            table: self.table.clone(),
            key: key.to_vec(),
            value: Some(value.to_vec()),
        })
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.tx.writes.push(TableWrite {
            table: self.table.clone(),
            key: key.to_vec(),
            value: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitSuccess {
    /// The transaction's writes were applied, producing `version`.
    Ok { version: Version },
    /// The transaction had no writes. The store is still at `version`.
    Empty { version: Version },
}

impl CommitSuccess {
    pub fn version(&self) -> Version {
        match self {
            CommitSuccess::Ok { version } | CommitSuccess::Empty { version } => *version,
        }
    }
}

#[derive(Debug)]
pub enum CommitError {
    /// Another transaction committed after this one began.
    Conflict { expected: Version, found: Version },
    /// The transaction wrote to a table that is not registered with the store.
    UnknownTable { table: String },
    KVGetError(KVGetError),
}

impl From<KVGetError> for CommitError {
    fn from(value: KVGetError) -> Self {
        CommitError::KVGetError(value)
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::Conflict { expected, found } => write!(
                f,
                "transaction began at version {}, but the store is at version {}",
                expected, found
            ),
            CommitError::UnknownTable { table } => write!(f, "table {} is not registered", table),
            CommitError::KVGetError(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for CommitError {}
