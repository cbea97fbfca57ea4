pub(crate) mod cluster;

pub(crate) mod executor;

pub(crate) mod logging;

pub(crate) mod mem_db;

pub(crate) mod network;
