/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The ordering and ledger kernel of a PBFT replicated state machine.
//!
//! A cluster of `3f + 1` replicas agrees on a single total order of client requests despite up to `f`
//! Byzantine replicas. The primary of the current view batches requests into
//! [pre-prepares](pbft::pre_prepare::PrePrepare), every replica executes each batch through the library
//! user's [`Executor`](execution::Executor), and batches that gather a prepare quorum and then a commit
//! quorum are written, in sequence number order, to a [ledger](ledger) that can later be replayed to
//! reconstruct the replica's state.
//!
//! The library user plugs in:
//! - A [key-value store](ledger::pluggables::KVStore) to persist the ledger,
//! - A [network](networking::Network) to exchange messages with other principals, and
//! - An [executor](execution::Executor) that runs requests against the application.
//!
//! and then builds and drives a [replica](replica).

pub mod types;

pub mod req_queue;

pub mod pbft;

pub mod execution;

pub mod ledger;

pub mod networking;

pub mod framing;

pub mod events;

pub(crate) mod event_bus;

pub mod logging;

pub mod replica;
