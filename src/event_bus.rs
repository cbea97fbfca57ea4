/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that receives events from the replica and runs their handlers.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) receive_request_handlers: Vec<HandlerPtr<ReceiveRequestEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) prepare_handlers: Vec<HandlerPtr<PrepareEvent>>,
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) receive_pre_prepare_handlers: Vec<HandlerPtr<ReceivePrePrepareEvent>>,
    pub(crate) receive_prepare_handlers: Vec<HandlerPtr<ReceivePrepareEvent>>,
    pub(crate) receive_commit_handlers: Vec<HandlerPtr<ReceiveCommitEvent>>,
    pub(crate) collect_prepare_certificate_handlers: Vec<HandlerPtr<CollectPrepareCertificateEvent>>,
    pub(crate) collect_commit_certificate_handlers: Vec<HandlerPtr<CollectCommitCertificateEvent>>,
    pub(crate) tentative_execute_handlers: Vec<HandlerPtr<TentativeExecuteEvent>>,
    pub(crate) execute_handlers: Vec<HandlerPtr<ExecuteEvent>>,
    pub(crate) replay_entry_handlers: Vec<HandlerPtr<ReplayEntryEvent>>,
    pub(crate) protocol_violation_handlers: Vec<HandlerPtr<ProtocolViolationEvent>>,
    pub(crate) view_change_suggested_handlers: Vec<HandlerPtr<ViewChangeSuggestedEvent>>,
}

// Push the default logger (if enabled) and the user's handler (if any) onto a handler list.
fn handlers<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(user_handler) = user_handler {
        handlers.push(user_handler);
    }
    handlers
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        receive_request_handler: Option<HandlerPtr<ReceiveRequestEvent>>,
        propose_handler: Option<HandlerPtr<ProposeEvent>>,
        prepare_handler: Option<HandlerPtr<PrepareEvent>>,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        receive_pre_prepare_handler: Option<HandlerPtr<ReceivePrePrepareEvent>>,
        receive_prepare_handler: Option<HandlerPtr<ReceivePrepareEvent>>,
        receive_commit_handler: Option<HandlerPtr<ReceiveCommitEvent>>,
        collect_prepare_certificate_handler: Option<HandlerPtr<CollectPrepareCertificateEvent>>,
        collect_commit_certificate_handler: Option<HandlerPtr<CollectCommitCertificateEvent>>,
        tentative_execute_handler: Option<HandlerPtr<TentativeExecuteEvent>>,
        execute_handler: Option<HandlerPtr<ExecuteEvent>>,
        replay_entry_handler: Option<HandlerPtr<ReplayEntryEvent>>,
        protocol_violation_handler: Option<HandlerPtr<ProtocolViolationEvent>>,
        view_change_suggested_handler: Option<HandlerPtr<ViewChangeSuggestedEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            receive_request_handlers: handlers(log_events, receive_request_handler),
            propose_handlers: handlers(log_events, propose_handler),
            prepare_handlers: handlers(log_events, prepare_handler),
            commit_handlers: handlers(log_events, commit_handler),
            receive_pre_prepare_handlers: handlers(log_events, receive_pre_prepare_handler),
            receive_prepare_handlers: handlers(log_events, receive_prepare_handler),
            receive_commit_handlers: handlers(log_events, receive_commit_handler),
            collect_prepare_certificate_handlers: handlers(log_events, collect_prepare_certificate_handler),
            collect_commit_certificate_handlers: handlers(log_events, collect_commit_certificate_handler),
            tentative_execute_handlers: handlers(log_events, tentative_execute_handler),
            execute_handlers: handlers(log_events, execute_handler),
            replay_entry_handlers: handlers(log_events, replay_entry_handler),
            protocol_violation_handlers: handlers(log_events, protocol_violation_handler),
            view_change_suggested_handlers: handlers(log_events, view_change_suggested_handler),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.receive_request_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.prepare_handlers.is_empty()
            && self.commit_handlers.is_empty()
            && self.receive_pre_prepare_handlers.is_empty()
            && self.receive_prepare_handlers.is_empty()
            && self.receive_commit_handlers.is_empty()
            && self.collect_prepare_certificate_handlers.is_empty()
            && self.collect_commit_certificate_handlers.is_empty()
            && self.tentative_execute_handlers.is_empty()
            && self.execute_handlers.is_empty()
            && self.replay_entry_handlers.is_empty()
            && self.protocol_violation_handlers.is_empty()
            && self.view_change_suggested_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::ReceiveRequest(receive_request_event) => self
                .receive_request_handlers
                .iter()
                .for_each(|handler| handler(&receive_request_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Prepare(prepare_event) => self
                .prepare_handlers
                .iter()
                .for_each(|handler| handler(&prepare_event)),

            Event::Commit(commit_event) => self
                .commit_handlers
                .iter()
                .for_each(|handler| handler(&commit_event)),

            Event::ReceivePrePrepare(receive_pre_prepare_event) => self
                .receive_pre_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_pre_prepare_event)),

            Event::ReceivePrepare(receive_prepare_event) => self
                .receive_prepare_handlers
                .iter()
                .for_each(|handler| handler(&receive_prepare_event)),

            Event::ReceiveCommit(receive_commit_event) => self
                .receive_commit_handlers
                .iter()
                .for_each(|handler| handler(&receive_commit_event)),

            Event::CollectPrepareCertificate(collect_prepare_certificate_event) => self
                .collect_prepare_certificate_handlers
                .iter()
                .for_each(|handler| handler(&collect_prepare_certificate_event)),

            Event::CollectCommitCertificate(collect_commit_certificate_event) => self
                .collect_commit_certificate_handlers
                .iter()
                .for_each(|handler| handler(&collect_commit_certificate_event)),

            Event::TentativeExecute(tentative_execute_event) => self
                .tentative_execute_handlers
                .iter()
                .for_each(|handler| handler(&tentative_execute_event)),

            Event::Execute(execute_event) => self
                .execute_handlers
                .iter()
                .for_each(|handler| handler(&execute_event)),

            Event::ReplayEntry(replay_entry_event) => self
                .replay_entry_handlers
                .iter()
                .for_each(|handler| handler(&replay_entry_event)),

            Event::ProtocolViolation(protocol_violation_event) => self
                .protocol_violation_handlers
                .iter()
                .for_each(|handler| handler(&protocol_violation_event)),

            Event::ViewChangeSuggested(view_change_suggested_event) => self
                .view_change_suggested_handlers
                .iter()
                .for_each(|handler| handler(&view_change_suggested_event)),
        }
    }
}

/// Spawn the event bus thread. On shutdown, the thread fires the handlers of every event already
/// published before returning.
pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut shutting_down = false;
        loop {
            if !shutting_down {
                shutting_down = match shutdown_signal.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => true,
                    Err(TryRecvError::Empty) => false,
                };
            }

            match event_subscriber.try_recv() {
                Ok(event) => event_handlers.fire_handlers(event),
                Err(TryRecvError::Empty) if shutting_down => return,
                Err(TryRecvError::Empty) => thread::yield_now(),
                Err(TryRecvError::Disconnected) => return,
            }
        }
    })
}
