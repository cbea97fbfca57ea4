/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The three-phase ordering protocol: pre-prepare, prepare, and commit.
//!
//! The primary of a view assigns a sequence number to a batch of requests by building a
//! [`PrePrepare`](pre_prepare::PrePrepare), executing it, and broadcasting it. Backups validate and
//! execute the batch, then vote for it with [`Prepare`](messages::Prepare)s. Once a replica has `2f`
//! matching prepares, it broadcasts a [`Commit`](messages::Commit); once it has `2f + 1` matching
//! commits, the batch is committed and can be written to the ledger.
//!
//! View change is not implemented. Replicas count the protocol violations they observe, and suggest a
//! view change to their host when the count passes a configured threshold.

pub mod messages;

pub mod pre_prepare;

pub mod slots;

pub mod types;
