/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The durable, replayable record of agreed batches.
//!
//! - [`store`]: the adaptor over the user's key-value store, with named tables and scoped transactions.
//! - [`writer`]: writes committed batches to the ledger info table.
//! - [`replay`]: rebuilds the store and replica state from the ledger stream.

pub mod entries;

pub mod pluggables;

pub mod replay;

pub mod store;

pub mod variables;

pub mod writer;
