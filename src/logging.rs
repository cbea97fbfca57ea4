/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the replica's
//! [config](crate::replica::Configuration).
//!
//! The crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed
//! onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values are
//! always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet is
//! how a [ReceivePrePrepare](crate::events::ReceivePrePrepareEvent) is printed:
//!
//! ```text
//! ReceivePrePrepare, 1701329264, 0, 0, 12, fNGCJyk
//! ```
//!
//! In the snippet:
//! - The third value is the id of the primary that sent the pre-prepare.
//! - The fourth and fifth values are the view and sequence number of the pre-prepare.
//! - The sixth value is the first seven characters of the Base64 encoding of the pre-prepare's digest.

use std::time::SystemTime;

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;
use crate::ledger::replay::DeserialiseSuccess;

// Names of each event in PascalCase for printing:
pub const RECEIVE_REQUEST: &str = "ReceiveRequest";

pub const PROPOSE: &str = "Propose";
pub const PREPARE: &str = "Prepare";
pub const COMMIT: &str = "Commit";

pub const RECEIVE_PRE_PREPARE: &str = "ReceivePrePrepare";
pub const RECEIVE_PREPARE: &str = "ReceivePrepare";
pub const RECEIVE_COMMIT: &str = "ReceiveCommit";

pub const COLLECT_PREPARE_CERTIFICATE: &str = "CollectPrepareCertificate";
pub const COLLECT_COMMIT_CERTIFICATE: &str = "CollectCommitCertificate";

pub const TENTATIVE_EXECUTE: &str = "TentativeExecute";
pub const EXECUTE: &str = "Execute";
pub const REPLAY_ENTRY: &str = "ReplayEntry";

pub const PROTOCOL_VIOLATION: &str = "ProtocolViolation";
pub const VIEW_CHANGE_SUGGESTED: &str = "ViewChangeSuggested";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for ReceiveRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_request_event: &ReceiveRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_REQUEST,
                secs_since_unix_epoch(receive_request_event.timestamp),
                receive_request_event
                    .origin
                    .map(|origin| origin.to_string())
                    .unwrap_or_else(|| String::from("local")),
                receive_request_event.client,
                receive_request_event.request_id,
                first_seven_base64_chars(&receive_request_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.view,
                propose_event.seqno,
                first_seven_base64_chars(&propose_event.digest.bytes()),
                propose_event.num_requests
            )
        };
        Box::new(logger)
    }
}

impl Logger for PrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |prepare_event: &PrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PREPARE,
                secs_since_unix_epoch(prepare_event.timestamp),
                prepare_event.prepare.view,
                prepare_event.prepare.seqno,
                first_seven_base64_chars(&prepare_event.prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_event: &CommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT,
                secs_since_unix_epoch(commit_event.timestamp),
                commit_event.commit.view,
                commit_event.commit.seqno,
                first_seven_base64_chars(&commit_event.commit.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_pre_prepare_event: &ReceivePrePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PRE_PREPARE,
                secs_since_unix_epoch(receive_pre_prepare_event.timestamp),
                receive_pre_prepare_event.origin,
                receive_pre_prepare_event.view,
                receive_pre_prepare_event.seqno,
                first_seven_base64_chars(&receive_pre_prepare_event.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceivePrepareEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_prepare_event: &ReceivePrepareEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_PREPARE,
                secs_since_unix_epoch(receive_prepare_event.timestamp),
                receive_prepare_event.origin,
                receive_prepare_event.prepare.view,
                receive_prepare_event.prepare.seqno,
                first_seven_base64_chars(&receive_prepare_event.prepare.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveCommitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_commit_event: &ReceiveCommitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_COMMIT,
                secs_since_unix_epoch(receive_commit_event.timestamp),
                receive_commit_event.origin,
                receive_commit_event.commit.view,
                receive_commit_event.commit.seqno,
                first_seven_base64_chars(&receive_commit_event.commit.digest.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CollectPrepareCertificateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |collect_prepare_certificate_event: &CollectPrepareCertificateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COLLECT_PREPARE_CERTIFICATE,
                secs_since_unix_epoch(collect_prepare_certificate_event.timestamp),
                collect_prepare_certificate_event.certificate.view,
                collect_prepare_certificate_event.certificate.seqno,
                first_seven_base64_chars(&collect_prepare_certificate_event.certificate.digest.bytes()),
                collect_prepare_certificate_event.certificate.signatures.count()
            )
        };
        Box::new(logger)
    }
}

impl Logger for CollectCommitCertificateEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |collect_commit_certificate_event: &CollectCommitCertificateEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                COLLECT_COMMIT_CERTIFICATE,
                secs_since_unix_epoch(collect_commit_certificate_event.timestamp),
                collect_commit_certificate_event.certificate.view,
                collect_commit_certificate_event.certificate.seqno,
                first_seven_base64_chars(&collect_commit_certificate_event.certificate.digest.bytes()),
                collect_commit_certificate_event.certificate.signatures.count()
            )
        };
        Box::new(logger)
    }
}

impl Logger for TentativeExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |tentative_execute_event: &TentativeExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                TENTATIVE_EXECUTE,
                secs_since_unix_epoch(tentative_execute_event.timestamp),
                tentative_execute_event.seqno,
                tentative_execute_event.num_requests,
                first_seven_base64_chars(&tentative_execute_event.full_state_merkle_root.bytes()),
                tentative_execute_event.ctx.int()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ExecuteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |execute_event: &ExecuteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EXECUTE,
                secs_since_unix_epoch(execute_event.timestamp),
                execute_event.seqno,
                first_seven_base64_chars(&execute_event.digest.bytes()),
                execute_event.version
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReplayEntryEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |replay_entry_event: &ReplayEntryEvent| {
            let outcome = match replay_entry_event.outcome {
                DeserialiseSuccess::Failed => "Failed",
                DeserialiseSuccess::Pass => "Pass",
                DeserialiseSuccess::PassPrePrepare => "PassPrePrepare",
            };
            log::info!(
                "{}, {}, {}, {}",
                REPLAY_ENTRY,
                secs_since_unix_epoch(replay_entry_event.timestamp),
                outcome,
                replay_entry_event.last_executed
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProtocolViolationEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |protocol_violation_event: &ProtocolViolationEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                PROTOCOL_VIOLATION,
                secs_since_unix_epoch(protocol_violation_event.timestamp),
                protocol_violation_event.violation.origin(),
                protocol_violation_event.violation
            )
        };
        Box::new(logger)
    }
}

impl Logger for ViewChangeSuggestedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |view_change_suggested_event: &ViewChangeSuggestedEvent| {
            log::warn!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_SUGGESTED,
                secs_since_unix_epoch(view_change_suggested_event.timestamp),
                view_change_suggested_event.view,
                view_change_suggested_event.violations
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
