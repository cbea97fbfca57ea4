/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and drive a replica.
//!
//! A replica orders client requests together with the other replicas in its cluster, executes them
//! through the library user's [`Executor`], and writes the agreed order to the ledger through the
//! [store adaptor](crate::ledger::store::Store).
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the replica](ReplicaSpec) with:
//!   1. `ReplicaSpec::builder` to construct a `ReplicaSpecBuilder`,
//!   2. The setters of the `ReplicaSpecBuilder`, and
//!   3. The `ReplicaSpecBuilder::build` method to construct a [ReplicaSpec],
//! - The function to [start](ReplicaSpec::start) a [Replica] given its specification,
//! - [The type](Replica) which holds the replica's protocol state, and whose methods drive it.
//!
//! ## Driving a replica
//!
//! A replica is single-threaded: all of its protocol state transitions happen inside calls to its
//! methods, on the thread that owns it. The host calls:
//! - [`receive_request`](Replica::receive_request) to submit a client request,
//! - [`process_messages`](Replica::process_messages) to drain and handle every message available from
//!   the network, and
//! - [`try_propose`](Replica::try_propose) to let the primary batch queued requests into pre-prepares.
//!
//! [`step`](Replica::step) does the last two in one call. Only the event bus, which runs event handlers,
//! lives on a thread of its own.
//!
//! ## Starting a replica
//!
//! Here is an example that demonstrates how to build and start a replica using the builder pattern:
//!
//! ```ignore
//! let mut replica =
//!     ReplicaSpec::builder()
//!     .executor(executor)
//!     .network(network)
//!     .store(&store)
//!     .configuration(configuration)
//!     .on_execute(execute_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! The replica's [configuration](Configuration) can also be defined using the builder pattern, for
//! example:
//!
//! ```ignore
//! let configuration =
//!     Configuration::builder()
//!     .me(signing_key)
//!     .node_info(node_info)
//!     .max_batch_size(16)
//!     .max_requests_in_flight(64)
//!     .ledger_write_retries(3)
//!     .max_protocol_violations(10)
//!     .replay_reexecutes(true)
//!     .log_events(true)
//!     .build()
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::SystemTime;

use ed25519_dalek::SigningKey;
use typed_builder::TypedBuilder;

use crate::event_bus::*;
use crate::events::*;
use crate::execution::{check_roots, execute_batch, ExecutionFault, Executor};
use crate::ledger::{
    entries::LedgerInfo,
    pluggables::{KVGetError, KVStore},
    replay::{DeserialiseSuccess, ReplayError, ReplayState},
    store::Store,
    writer::{LedgerWriteError, LedgerWriter},
};
use crate::networking::{Message, Network};
use crate::pbft::{
    messages::{Commit, PbftMessage, Prepare, SignedPrePrepare},
    pre_prepare::{PrePrepare, PrePrepareError},
    slots::{CertificationLog, DroppedVote, SlotPhase},
    types::{Phase, ProtocolViolation},
};
use crate::req_queue::{ReqQueue, ReqQueueError};
use crate::types::{
    basic::{ClientId, CryptoHash, PrincipalId, RequestId, SeqNo, ViewNumber},
    crypto_primitives::Keypair,
    principals::{ConfigurationError, NodeInfo, PrincipalSet},
    request::{AuthError, IntakeInfo, Request},
    signed_messages::SignedMessage,
};

/// Stores the user-defined parameters required to start the replica, that is:
/// 1. The replica's [keypair](ed25519_dalek::SigningKey).
/// 2. The replica's [node info](NodeInfo), which lists every principal in the cluster.
/// 3. The maximum number of requests in a batch.
/// 4. The maximum number of sequence numbers in flight, i.e., assigned but not yet executed.
/// 5. The number of times a conflicting ledger write is retried before it is escalated.
/// 6. The number of protocol violations the replica tolerates before it suggests a view change.
/// 7. Whether ledger replay re-executes requests through the executor.
/// 8. Whether client requests must be signed.
/// 9. The "Log Events" flag, if set to "true" then logs should be printed.
///
/// ## Log Events
///
/// The crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
/// printed onto a terminal or to a file, set up a [logging
/// implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.me(...)`
    - `.node_info(...)`
    - `.max_batch_size(...)`
    - `.max_requests_in_flight(...)`
    - `.ledger_write_retries(...)`
    - `.max_protocol_violations(...)`
    - `.replay_reexecutes(...)`
    - `.log_events(...)`

    Optional:
    - `.require_signed_requests(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set the replica's keypair, used to sign messages. Required."))]
    pub me: SigningKey,
    #[builder(setter(doc = "Set the replica's node info, which identifies it and lists the principals of the cluster. Required."))]
    pub node_info: NodeInfo,
    #[builder(setter(doc = "Set the maximum number of requests the primary puts in a single pre-prepare. Required."))]
    pub max_batch_size: usize,
    #[builder(setter(doc = "Set the maximum gap between the last executed sequence number and the sequence numbers being ordered. Required."))]
    pub max_requests_in_flight: u64,
    #[builder(setter(doc = "Set the number of times a ledger write that conflicts with another transaction is retried. Required."))]
    pub ledger_write_retries: usize,
    #[builder(setter(doc = "Set the number of protocol violations after which the replica suggests a view change. Required."))]
    pub max_protocol_violations: u64,
    #[builder(setter(doc = "Set whether replaying the ledger re-executes requests to check the recorded merkle roots. Required."))]
    pub replay_reexecutes: bool,
    #[builder(default = false, setter(doc = "Set whether unsigned client requests are rejected. Optional, defaults to false."))]
    pub require_signed_requests: bool,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

/// Stores all necessary parameters and trait implementations required to run the [Replica].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [ReplicaSpec]. On the builder call the following methods to construct a valid [ReplicaSpec].

    Required:
    - `.executor(...)`
    - `.network(...)`
    - `.store(...)`
    - `.configuration(...)`

    Optional:
    - `.on_receive_request(...)`
    - `.on_propose(...)`
    - `.on_prepare(...)`
    - `.on_commit(...)`
    - `.on_receive_pre_prepare(...)`
    - `.on_receive_prepare(...)`
    - `.on_receive_commit(...)`
    - `.on_collect_prepare_certificate(...)`
    - `.on_collect_commit_certificate(...)`
    - `.on_tentative_execute(...)`
    - `.on_execute(...)`
    - `.on_replay_entry(...)`
    - `.on_protocol_violation(...)`
    - `.on_view_change_suggested(...)`
"))]
pub struct ReplicaSpec<'s, K: KVStore, E: Executor, N: Network> {
    // Required parameters
    #[builder(setter(doc = "Set the application code that executes requests. The argument must implement the [Executor](crate::execution::Executor) trait. Required."))]
    executor: E,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [store adaptor](crate::ledger::store::Store) that the ledger is written to. Required."))]
    store: &'s Store<K>,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a replica. Required."))]
    configuration: Configuration,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveRequestEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveRequestEvent>),
    doc = "Register a handler closure to be invoked after the replica queues a client request. Optional."))]
    on_receive_request: Option<HandlerPtr<ReceiveRequestEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the replica, as primary, broadcasts a pre-prepare. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a prepare. Optional."))]
    on_prepare: Option<HandlerPtr<PrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the replica broadcasts a commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica accepts a pre-prepare from the primary. Optional."))]
    on_receive_pre_prepare: Option<HandlerPtr<ReceivePrePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceivePrepareEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceivePrepareEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a correctly signed prepare. Optional."))]
    on_receive_prepare: Option<HandlerPtr<ReceivePrepareEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveCommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveCommitEvent>),
    doc = "Register a handler closure to be invoked after the replica receives a correctly signed commit. Optional."))]
    on_receive_commit: Option<HandlerPtr<ReceiveCommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CollectPrepareCertificateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CollectPrepareCertificateEvent>),
    doc = "Register a handler closure to be invoked after a batch becomes prepared. Optional."))]
    on_collect_prepare_certificate: Option<HandlerPtr<CollectPrepareCertificateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CollectCommitCertificateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CollectCommitCertificateEvent>),
    doc = "Register a handler closure to be invoked after a batch becomes committed. Optional."))]
    on_collect_commit_certificate: Option<HandlerPtr<CollectCommitCertificateEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TentativeExecuteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TentativeExecuteEvent>),
    doc = "Register a handler closure to be invoked after the replica tentatively executes a batch. Optional."))]
    on_tentative_execute: Option<HandlerPtr<TentativeExecuteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ExecuteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ExecuteEvent>),
    doc = "Register a handler closure to be invoked after a committed batch is written to the ledger. Optional."))]
    on_execute: Option<HandlerPtr<ExecuteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReplayEntryEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReplayEntryEvent>),
    doc = "Register a handler closure to be invoked after the replica replays an entry of a ledger stream. Optional."))]
    on_replay_entry: Option<HandlerPtr<ReplayEntryEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProtocolViolationEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProtocolViolationEvent>),
    doc = "Register a handler closure to be invoked after the replica drops a message that violates the protocol. Optional."))]
    on_protocol_violation: Option<HandlerPtr<ProtocolViolationEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ViewChangeSuggestedEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ViewChangeSuggestedEvent>),
    doc = "Register a handler closure to be invoked when the replica has seen more protocol violations than it tolerates. Optional."))]
    on_view_change_suggested: Option<HandlerPtr<ViewChangeSuggestedEvent>>,
}

impl<'s, K: KVStore, E: Executor, N: Network> ReplicaSpec<'s, K, E, N> {
    /// Validate the configuration, connect the network to every principal, start the event bus (if any
    /// handler is registered), and resume from the last batch recorded in the store.
    pub fn start(mut self) -> Result<Replica<'s, K, E, N>, ReplicaError> {
        let node_info = &self.configuration.node_info;
        let principals = PrincipalSet::from_general_info(&node_info.general_info)?;
        let id = node_info.own_info.id;
        let my_pos = principals
            .position(&id)
            .ok_or(ConfigurationError::UnknownSelf { id })?;
        if principals.verifying_key(&id) != Some(&Keypair::new(self.configuration.me.clone()).public()) {
            return Err(ConfigurationError::OwnKeyMismatch { id }.into());
        }

        for principal in &node_info.general_info.principal_info {
            self.network.add_principal(principal);
        }

        let last_executed = match self.store.ledger_info()? {
            Some(LedgerInfo::PrePrepare(info)) => info.seqno,
            _ => SeqNo::init(),
        };
        let ordered = self.store.ordered_requests()?.unwrap_or_default();
        let view = ViewNumber::init();
        let mut log = CertificationLog::new(view, principals.len());
        log.reset(last_executed);

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_receive_request,
            self.on_propose,
            self.on_prepare,
            self.on_commit,
            self.on_receive_pre_prepare,
            self.on_receive_prepare,
            self.on_receive_commit,
            self.on_collect_prepare_certificate,
            self.on_collect_commit_certificate,
            self.on_tentative_execute,
            self.on_execute,
            self.on_replay_entry,
            self.on_protocol_violation,
            self.on_view_change_suggested,
        );

        let (event_publisher, event_bus, event_bus_shutdown) = if !event_handlers.is_empty() {
            let (event_publisher, event_subscriber) = mpsc::channel();
            let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
            let event_bus = start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
            (Some(event_publisher), Some(event_bus), Some(event_bus_shutdown))
        } else {
            (None, None, None)
        };

        log::debug!(
            "Replica {} started at position {} of {}, resuming after seqno {} and {} requests",
            id,
            my_pos,
            principals.len(),
            last_executed,
            ordered.total_requests_executed
        );

        Ok(Replica {
            me: self.configuration.me,
            id,
            my_pos,
            principals,
            max_batch_size: self.configuration.max_batch_size,
            max_requests_in_flight: self.configuration.max_requests_in_flight,
            ledger_write_retries: self.configuration.ledger_write_retries,
            max_protocol_violations: self.configuration.max_protocol_violations,
            replay_reexecutes: self.configuration.replay_reexecutes,
            require_signed_requests: self.configuration.require_signed_requests,
            view,
            executor: self.executor,
            network: self.network,
            store: self.store,
            req_queue: ReqQueue::with_ordered(ordered.last_request_ids),
            log,
            next_seqno: last_executed.next(),
            last_tentative: last_executed,
            total_requests_executed: ordered.total_requests_executed,
            replay_state: ReplayState::new(),
            protocol_violations: 0,
            view_change_suggested: false,
            fault: None,
            event_publisher,
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// A running replica. When this value is dropped, the event bus thread is shut down after it has fired
/// the handlers of every event already published.
pub struct Replica<'s, K: KVStore, E: Executor, N: Network> {
    me: SigningKey,
    id: PrincipalId,
    my_pos: usize,
    principals: PrincipalSet,
    max_batch_size: usize,
    max_requests_in_flight: u64,
    ledger_write_retries: usize,
    max_protocol_violations: u64,
    replay_reexecutes: bool,
    require_signed_requests: bool,
    view: ViewNumber,
    executor: E,
    network: N,
    store: &'s Store<K>,
    req_queue: ReqQueue,
    log: CertificationLog,
    // Next sequence number to propose, as primary.
    next_seqno: SeqNo,
    // Highest sequence number tentatively executed. Never less than `log.last_executed()`.
    last_tentative: SeqNo,
    total_requests_executed: u64,
    replay_state: ReplayState,
    protocol_violations: u64,
    view_change_suggested: bool,
    fault: Option<ExecutionFault>,
    event_publisher: Option<Sender<Event>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl<'s, K: KVStore, E: Executor, N: Network> Replica<'s, K, E, N> {
    /* ↓↓↓ Request intake ↓↓↓ */

    /// Authenticate `request` and append it to the request queue. `origin` is the principal that
    /// forwarded the request, if it did not originate locally.
    pub fn receive_request(&mut self, origin: Option<PrincipalId>, mut request: Request) -> Result<(), ReplicaError> {
        request.verify(
            self.principals.verifying_key(&request.client_id()),
            self.require_signed_requests,
        )?;
        request.set_intake(IntakeInfo {
            received_from: origin,
            received_at: Some(SystemTime::now()),
        });

        let (client, request_id, digest) = (request.client_id(), request.request_id(), request.digest());
        self.req_queue.append(request)?;

        Event::publish(
            &self.event_publisher,
            Event::ReceiveRequest(ReceiveRequestEvent {
                timestamp: SystemTime::now(),
                origin,
                client,
                request_id,
                digest,
            }),
        );
        Ok(())
    }

    /* ↓↓↓ Driving ↓↓↓ */

    /// Handle every message currently available from the network, then make whatever progress the
    /// messages allow. Returns the number of messages handled.
    pub fn process_messages(&mut self) -> Result<usize, ReplicaError> {
        self.check_fault()?;

        let mut handled = 0;
        while let Some((origin, message)) = self.network.recv() {
            handled += 1;
            match message {
                Message::Request(request) => {
                    if let Err(err) = self.receive_request(Some(origin), request) {
                        log::warn!("Dropped request forwarded by {}: {}", origin, err);
                    }
                }
                Message::Pbft(message) => self.on_pbft_message(origin, message)?,
            }
        }

        self.advance()?;
        Ok(handled)
    }

    /// If this replica is the primary, batch queued requests into pre-prepares, for as long as the
    /// request queue is not empty and the window has room. Returns the number of pre-prepares proposed.
    pub fn try_propose(&mut self) -> Result<usize, ReplicaError> {
        self.check_fault()?;
        if !self.is_primary() {
            return Ok(0);
        }

        let mut proposed = 0;
        while !self.req_queue.is_empty() && self.next_seqno <= self.window_end() {
            self.propose()?;
            proposed += 1;
        }

        if proposed > 0 {
            self.advance()?;
        }
        Ok(proposed)
    }

    /// Process messages, then propose.
    pub fn step(&mut self) -> Result<(), ReplicaError> {
        self.process_messages()?;
        self.try_propose()?;
        Ok(())
    }

    /* ↓↓↓ Replay ↓↓↓ */

    /// Replay one entry of a ledger stream into the replica's store. A rejected entry is logged and
    /// reported as [`DeserialiseSuccess::Failed`], and changes nothing.
    pub fn deserialise(&mut self, entry: &[u8]) -> DeserialiseSuccess {
        match self.replay_entry(entry) {
            Ok(success) => success,
            Err(err) => {
                log::warn!("Ledger entry rejected after seqno {}: {}", self.replay_state.last_executed(), err);
                DeserialiseSuccess::Failed
            }
        }
    }

    /// Replay a ledger stream, stopping at the first entry that is rejected. Returns the number of
    /// entries accepted.
    ///
    /// If the configuration has the replay re-execute batches and re-executing one fails, the replica
    /// halts as it would on a live execution fault.
    pub fn replay_ledger<I>(&mut self, entries: I) -> Result<usize, ReplicaError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let mut accepted = 0;
        for entry in entries {
            if let Err(source) = self.replay_entry(entry.as_ref()) {
                return Err(ReplicaError::Replay { accepted, source });
            }
            accepted += 1;
        }
        Ok(accepted)
    }

    /* ↓↓↓ Accessors ↓↓↓ */

    pub fn id(&self) -> PrincipalId {
        self.id
    }

    pub fn view(&self) -> ViewNumber {
        self.view
    }

    pub fn is_primary(&self) -> bool {
        self.principals.primary(self.view) == self.id
    }

    pub fn principals(&self) -> &PrincipalSet {
        &self.principals
    }

    /// The highest sequence number whose batch has been written to the ledger.
    pub fn last_executed(&self) -> SeqNo {
        self.log.last_executed()
    }

    pub fn last_tentatively_executed(&self) -> SeqNo {
        self.last_tentative
    }

    pub fn total_requests_executed(&self) -> u64 {
        self.total_requests_executed
    }

    /// Get the certification phase of `seqno`, if the replica knows anything about it.
    pub fn phase(&self, seqno: SeqNo) -> Option<SlotPhase> {
        self.log.phase(seqno)
    }

    /// Number of requests waiting to be ordered.
    pub fn queued_requests(&self) -> usize {
        self.req_queue.len()
    }

    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations
    }

    pub fn view_change_suggested(&self) -> bool {
        self.view_change_suggested
    }

    /// The execution fault that halted the replica, if any.
    pub fn fault(&self) -> Option<&ExecutionFault> {
        self.fault.as_ref()
    }

    pub fn replay_state(&self) -> &ReplayState {
        &self.replay_state
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn store(&self) -> &'s Store<K> {
        self.store
    }

    /* ↓↓↓ Primary ↓↓↓ */

    /// The highest sequence number inside the window.
    fn window_end(&self) -> SeqNo {
        self.log.last_executed().saturating_add(self.max_requests_in_flight)
    }

    fn propose(&mut self) -> Result<(), ReplicaError> {
        let seqno = self.next_seqno;
        let mut pre_prepare = PrePrepare::new(self.view, seqno, &mut self.req_queue, self.max_batch_size)?;
        pre_prepare.set_non_determinism(secs_since_unix_epoch().to_le_bytes().to_vec())?;

        let (byz_info, executed) = match execute_batch(
            &mut self.executor,
            seqno,
            pre_prepare.requests().iter(),
            pre_prepare.non_determinism(),
            self.total_requests_executed,
        ) {
            Ok(result) => result,
            Err(fault) => return Err(self.halt(fault)),
        };
        pre_prepare.set_merkle_roots_and_ctx(
            byz_info.full_state_merkle_root,
            byz_info.replicated_state_merkle_root,
            byz_info.ctx,
        )?;
        self.total_requests_executed += executed;
        self.last_tentative = seqno;
        self.next_seqno = seqno.next();

        let digest = pre_prepare.digest();
        let num_requests = pre_prepare.num_requests();
        let signed_pre_prepare = SignedPrePrepare::new(&self.me, pre_prepare.clone());

        let dropped = self.log.accept_pre_prepare(pre_prepare);
        self.record_dropped_votes(seqno, digest, dropped);
        Event::publish(
            &self.event_publisher,
            Event::TentativeExecute(TentativeExecuteEvent {
                timestamp: SystemTime::now(),
                seqno,
                num_requests,
                full_state_merkle_root: byz_info.full_state_merkle_root,
                ctx: byz_info.ctx,
            }),
        );
        self.log.set_tentative(seqno, byz_info);

        self.network.broadcast(signed_pre_prepare.into());
        Event::publish(
            &self.event_publisher,
            Event::Propose(ProposeEvent {
                timestamp: SystemTime::now(),
                view: self.view,
                seqno,
                digest,
                num_requests,
            }),
        );
        Ok(())
    }

    /* ↓↓↓ Message handling ↓↓↓ */

    fn on_pbft_message(&mut self, origin: PrincipalId, message: PbftMessage) -> Result<(), ReplicaError> {
        if !self.principals.is_replica(&origin) {
            self.record_violation(ProtocolViolation::NotAReplica { origin });
            return Ok(());
        }
        if message.view() != self.view {
            self.record_violation(ProtocolViolation::WrongView {
                origin,
                view: message.view(),
                expected: self.view,
            });
            return Ok(());
        }

        let seqno = message.seqno();
        if seqno <= self.log.last_executed() {
            log::debug!("Ignored message from {} for executed seqno {}", origin, seqno);
            return Ok(());
        }
        if seqno > self.window_end() {
            self.record_violation(ProtocolViolation::OutOfWindow { origin, seqno });
            return Ok(());
        }

        let correctly_signed = match (&message, self.principals.verifying_key(&origin)) {
            (PbftMessage::PrePrepare(pre_prepare), Some(key)) => pre_prepare.is_correct(key),
            (PbftMessage::Prepare(prepare), Some(key)) => prepare.is_correct(key),
            (PbftMessage::Commit(commit), Some(key)) => commit.is_correct(key),
            (_, None) => false,
        };
        if !correctly_signed {
            self.record_violation(ProtocolViolation::BadSignature { origin, seqno });
            return Ok(());
        }

        match message {
            PbftMessage::PrePrepare(signed_pre_prepare) => self.on_pre_prepare(origin, signed_pre_prepare)?,
            PbftMessage::Prepare(prepare) => self.on_prepare(origin, prepare),
            PbftMessage::Commit(commit) => self.on_commit(origin, commit),
        }
        Ok(())
    }

    fn on_pre_prepare(&mut self, origin: PrincipalId, signed_pre_prepare: SignedPrePrepare) -> Result<(), ReplicaError> {
        let pre_prepare = signed_pre_prepare.pre_prepare;
        let seqno = pre_prepare.seqno();

        if origin != self.principals.primary(self.view) {
            self.record_violation(ProtocolViolation::NotFromPrimary { origin, seqno });
            return Ok(());
        }
        if !pre_prepare.is_finalized() {
            self.record_violation(ProtocolViolation::NotFinalized { origin, seqno });
            return Ok(());
        }
        if pre_prepare.requests().is_empty() {
            self.record_violation(ProtocolViolation::EmptyBatch { origin, seqno });
            return Ok(());
        }

        let digest = pre_prepare.digest();
        match self.log.digest(seqno) {
            Some(accepted) if accepted == digest => {
                log::debug!("Ignored duplicate pre-prepare for seqno {}", seqno);
                return Ok(());
            }
            Some(_) => {
                self.record_violation(ProtocolViolation::ConflictingPrePrepare { origin, seqno });
                return Ok(());
            }
            None => (),
        }

        // Each client's requests must continue, in increasing id order, from the last one ordered.
        let mut batch_ids: HashMap<ClientId, RequestId> = HashMap::new();
        for request in pre_prepare.requests() {
            let (client, request_id) = (request.client_id(), request.request_id());
            if let Err(source) = request.verify(self.principals.verifying_key(&client), self.require_signed_requests) {
                self.record_violation(ProtocolViolation::InvalidRequest { origin, seqno, source });
                return Ok(());
            }

            let floor = batch_ids
                .get(&client)
                .copied()
                .or_else(|| self.req_queue.last_ordered(client));
            if floor.is_some_and(|floor| request_id <= floor) {
                self.record_violation(ProtocolViolation::RepeatedRequest {
                    origin,
                    seqno,
                    client,
                    request_id,
                });
                return Ok(());
            }
            batch_ids.insert(client, request_id);
        }

        Event::publish(
            &self.event_publisher,
            Event::ReceivePrePrepare(ReceivePrePrepareEvent {
                timestamp: SystemTime::now(),
                origin,
                view: pre_prepare.view(),
                seqno,
                digest,
            }),
        );

        for request in pre_prepare.requests() {
            self.req_queue.remove(request.client_id(), request.request_id());
        }
        let dropped = self.log.accept_pre_prepare(pre_prepare);
        self.record_dropped_votes(seqno, digest, dropped);

        self.execute_ready()
    }

    fn on_prepare(&mut self, origin: PrincipalId, prepare: Prepare) {
        if origin == self.principals.primary(self.view) {
            self.record_violation(ProtocolViolation::PrepareFromPrimary {
                origin,
                seqno: prepare.seqno,
            });
            return;
        }

        let Some(pos) = self.principals.position(&origin) else {
            return;
        };
        match self.log.add_prepare(pos, &prepare) {
            Ok(_) => Event::publish(
                &self.event_publisher,
                Event::ReceivePrepare(ReceivePrepareEvent {
                    timestamp: SystemTime::now(),
                    origin,
                    prepare,
                }),
            ),
            Err(expected) => self.record_violation(ProtocolViolation::VoteMismatch {
                origin,
                seqno: prepare.seqno,
                phase: Phase::Prepare,
                expected,
                found: prepare.digest,
            }),
        }
    }

    fn on_commit(&mut self, origin: PrincipalId, commit: Commit) {
        let Some(pos) = self.principals.position(&origin) else {
            return;
        };
        match self.log.add_commit(pos, &commit) {
            Ok(_) => Event::publish(
                &self.event_publisher,
                Event::ReceiveCommit(ReceiveCommitEvent {
                    timestamp: SystemTime::now(),
                    origin,
                    commit,
                }),
            ),
            Err(expected) => self.record_violation(ProtocolViolation::VoteMismatch {
                origin,
                seqno: commit.seqno,
                phase: Phase::Commit,
                expected,
                found: commit.digest,
            }),
        }
    }

    /* ↓↓↓ Execution and certification ↓↓↓ */

    // Tentatively execute accepted pre-prepares in seqno order, voting for each as it is executed.
    fn execute_ready(&mut self) -> Result<(), ReplicaError> {
        loop {
            let seqno = self.last_tentative.next();
            let Some(pre_prepare) = self.log.pre_prepare(seqno) else {
                return Ok(());
            };
            let digest = pre_prepare.digest();
            let num_requests = pre_prepare.num_requests();
            let expected_roots = (
                pre_prepare.full_state_merkle_root(),
                pre_prepare.replicated_state_merkle_root(),
            );
            let result = execute_batch(
                &mut self.executor,
                seqno,
                pre_prepare.requests().iter(),
                pre_prepare.non_determinism(),
                self.total_requests_executed,
            );

            let (byz_info, executed) = match result {
                Ok(result) => result,
                Err(fault) => return Err(self.halt(fault)),
            };

            if let Err(fault) = check_roots(seqno, expected_roots.0, expected_roots.1, &byz_info) {
                return Err(self.halt(fault));
            }

            self.total_requests_executed += executed;
            self.last_tentative = seqno;
            Event::publish(
                &self.event_publisher,
                Event::TentativeExecute(TentativeExecuteEvent {
                    timestamp: SystemTime::now(),
                    seqno,
                    num_requests,
                    full_state_merkle_root: byz_info.full_state_merkle_root,
                    ctx: byz_info.ctx,
                }),
            );
            self.log.set_tentative(seqno, byz_info);

            if !self.is_primary() {
                let prepare = Prepare::new(&self.me, self.view, seqno, digest);
                self.network.broadcast(prepare.clone().into());
                // Safety: the slot accepted a pre-prepare with this digest, so the vote matches it.
                let _ = self.log.add_prepare(self.my_pos, &prepare);
                Event::publish(
                    &self.event_publisher,
                    Event::Prepare(PrepareEvent {
                        timestamp: SystemTime::now(),
                        prepare,
                    }),
                );
            }
        }
    }

    // Collect whatever certificates the votes received so far allow, then write committed batches to the
    // ledger in seqno order.
    fn advance(&mut self) -> Result<(), ReplicaError> {
        for seqno in self.log.uncertified() {
            if let Some(certificate) = self.log.try_prepare(seqno, self.principals.prepare_quorum()) {
                let commit = Commit::new(&self.me, self.view, seqno, certificate.digest);
                Event::publish(
                    &self.event_publisher,
                    Event::CollectPrepareCertificate(CollectPrepareCertificateEvent {
                        timestamp: SystemTime::now(),
                        certificate,
                    }),
                );

                self.network.broadcast(commit.clone().into());
                let _ = self.log.add_commit(self.my_pos, &commit);
                Event::publish(
                    &self.event_publisher,
                    Event::Commit(CommitEvent {
                        timestamp: SystemTime::now(),
                        commit,
                    }),
                );
            }

            if let Some(certificate) = self.log.try_commit(seqno, self.principals.commit_quorum()) {
                Event::publish(
                    &self.event_publisher,
                    Event::CollectCommitCertificate(CollectCommitCertificateEvent {
                        timestamp: SystemTime::now(),
                        certificate,
                    }),
                );
            }
        }

        loop {
            let (seqno, digest, version) = match self.log.next_committed() {
                Some((pre_prepare, byz_info)) => {
                    let success = LedgerWriter::new(self.store, self.ledger_write_retries)
                        .write_pre_prepare_with_app_state(pre_prepare, &byz_info.app_state_updates)?;
                    (pre_prepare.seqno(), pre_prepare.digest(), success.version())
                }
                None => return Ok(()),
            };
            // Safety: `next_committed` only returns slots in the committed phase, which hold their certificate.
            let certificate = self
                .log
                .finalize_next()
                .expect("committed slot holds its commit certificate");

            log::debug!("Seqno {} executed and written to the ledger at version {}", seqno, version);
            Event::publish(
                &self.event_publisher,
                Event::Execute(ExecuteEvent {
                    timestamp: SystemTime::now(),
                    seqno,
                    digest,
                    version,
                    certificate,
                }),
            );
        }
    }

    /* ↓↓↓ Replay ↓↓↓ */

    fn replay_entry(&mut self, entry: &[u8]) -> Result<DeserialiseSuccess, ReplayError> {
        if let Some(fault) = &self.fault {
            return Err(ReplayError::ExecutionFault(fault.clone()));
        }

        let executor: Option<&mut dyn Executor> = if self.replay_reexecutes {
            Some(&mut self.executor)
        } else {
            None
        };
        let result = self
            .replay_state
            .replay_entry(self.store, entry, Some(&self.principals), executor);

        let outcome = match &result {
            Ok(success) => *success,
            Err(_) => DeserialiseSuccess::Failed,
        };
        // The executor ran batches that the store did not record.
        if let Err(ReplayError::ExecutionFault(fault)) = &result {
            self.halt(fault.clone());
        }
        if outcome == DeserialiseSuccess::PassPrePrepare {
            let last_executed = self.replay_state.last_executed();
            self.log.reset(last_executed);
            self.last_tentative = last_executed;
            self.next_seqno = last_executed.next();
            self.total_requests_executed = self.replay_state.total_requests_executed();
            for (client, request_id) in self.replay_state.last_request_ids() {
                self.req_queue.remove(client, request_id);
            }
        }

        Event::publish(
            &self.event_publisher,
            Event::ReplayEntry(ReplayEntryEvent {
                timestamp: SystemTime::now(),
                outcome,
                last_executed: self.replay_state.last_executed(),
            }),
        );
        result
    }

    /* ↓↓↓ Faults and violations ↓↓↓ */

    fn check_fault(&self) -> Result<(), ReplicaError> {
        match &self.fault {
            Some(fault) => Err(ReplicaError::ExecutionFault(fault.clone())),
            None => Ok(()),
        }
    }

    // Stop making progress, and return the error to surface to the host.
    fn halt(&mut self, fault: ExecutionFault) -> ReplicaError {
        log::error!("Replica {} halted: {}", self.id, fault);
        self.fault = Some(fault.clone());
        ReplicaError::ExecutionFault(fault)
    }

    fn record_dropped_votes(&mut self, seqno: SeqNo, expected: CryptoHash, dropped: Vec<DroppedVote>) {
        for vote in dropped {
            let Some(origin) = self.principals.replicas().nth(vote.pos).copied() else {
                continue;
            };
            self.record_violation(ProtocolViolation::VoteMismatch {
                origin,
                seqno,
                phase: vote.phase,
                expected,
                found: vote.digest,
            });
        }
    }

    fn record_violation(&mut self, violation: ProtocolViolation) {
        log::warn!("Replica {} dropped a message: {}", self.id, violation);
        self.protocol_violations += 1;
        Event::publish(
            &self.event_publisher,
            Event::ProtocolViolation(ProtocolViolationEvent {
                timestamp: SystemTime::now(),
                violation,
            }),
        );

        if self.protocol_violations > self.max_protocol_violations && !self.view_change_suggested {
            self.view_change_suggested = true;
            log::warn!(
                "Replica {} observed {} protocol violations in view {}; suggesting a view change",
                self.id,
                self.protocol_violations,
                self.view
            );
            Event::publish(
                &self.event_publisher,
                Event::ViewChangeSuggested(ViewChangeSuggestedEvent {
                    timestamp: SystemTime::now(),
                    view: self.view,
                    violations: self.protocol_violations,
                }),
            );
        }
    }
}

impl<'s, K: KVStore, E: Executor, N: Network> Drop for Replica<'s, K, E, N> {
    fn drop(&mut self) {
        if let Some(shutdown) = self.event_bus_shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(event_bus) = self.event_bus.take() {
            if event_bus.join().is_err() {
                log::error!("Event bus thread of replica {} panicked", self.id);
            }
        }
    }
}

fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[derive(Debug)]
pub enum ReplicaError {
    Configuration(ConfigurationError),
    Auth(AuthError),
    ReqQueue(ReqQueueError),
    PrePrepare(PrePrepareError),
    /// The replica cannot reconcile the result of executing a batch, and has halted.
    ExecutionFault(ExecutionFault),
    LedgerWrite(LedgerWriteError),
    /// Ledger replay stopped at a rejected entry, after accepting `accepted` entries.
    Replay { accepted: usize, source: ReplayError },
    KVGetError(KVGetError),
}

impl From<ConfigurationError> for ReplicaError {
    fn from(value: ConfigurationError) -> Self {
        ReplicaError::Configuration(value)
    }
}

impl From<AuthError> for ReplicaError {
    fn from(value: AuthError) -> Self {
        ReplicaError::Auth(value)
    }
}

impl From<ReqQueueError> for ReplicaError {
    fn from(value: ReqQueueError) -> Self {
        ReplicaError::ReqQueue(value)
    }
}

impl From<PrePrepareError> for ReplicaError {
    fn from(value: PrePrepareError) -> Self {
        ReplicaError::PrePrepare(value)
    }
}

impl From<ExecutionFault> for ReplicaError {
    fn from(value: ExecutionFault) -> Self {
        ReplicaError::ExecutionFault(value)
    }
}

impl From<LedgerWriteError> for ReplicaError {
    fn from(value: LedgerWriteError) -> Self {
        ReplicaError::LedgerWrite(value)
    }
}

impl From<KVGetError> for ReplicaError {
    fn from(value: KVGetError) -> Self {
        ReplicaError::KVGetError(value)
    }
}

impl fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaError::Configuration(err) => write!(f, "invalid configuration: {}", err),
            ReplicaError::Auth(err) => write!(f, "request rejected: {}", err),
            ReplicaError::ReqQueue(err) => write!(f, "request rejected: {}", err),
            ReplicaError::PrePrepare(err) => write!(f, "cannot build pre-prepare: {}", err),
            ReplicaError::ExecutionFault(fault) => write!(f, "execution fault: {}", fault),
            ReplicaError::LedgerWrite(err) => write!(f, "ledger write failed: {}", err),
            ReplicaError::Replay { accepted, source } => write!(
                f,
                "ledger replay stopped after {} entries: {}",
                accepted, source
            ),
            ReplicaError::KVGetError(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ReplicaError {}
