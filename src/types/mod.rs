/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of the ordering kernel.
//!
//! Other types and traits, specific to single components, can be found in the "types" submodules of
//! their components, e.g., [`crate::pbft::types`].

pub mod basic;

pub mod crypto_primitives;

pub mod principals;

pub mod request;

pub mod signed_messages;
