/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffer of authenticated requests that have not been ordered yet.
//!
//! The queue is owned by a single [replica](crate::replica::Replica) and mutated only by its protocol
//! driver. Requests leave the queue in two ways: the primary [takes a prefix](ReqQueue::take_prefix) of
//! it to build a [pre-prepare](crate::pbft::pre_prepare::PrePrepare), or a backup
//! [removes](ReqQueue::remove) the requests that a primary's pre-prepare ordered. Either way a request
//! that has left the queue is recorded as ordered, so it can never re-enter and end up in a second batch.
//!
//! Each client's requests are admitted in strictly increasing id order. A request whose id is not
//! greater than every id already admitted from its client is stale, whether the earlier request is still
//! queued or was ordered. Since the queue is drained from the front, the batches built from it carry each
//! client's requests in increasing id order too, which is the order in which ledger replay accepts them.

use std::collections::{hash_map, HashMap, HashSet, VecDeque};
use std::fmt;

use crate::types::{
    basic::{ClientId, RequestId},
    request::Request,
};

pub struct ReqQueue {
    requests: VecDeque<Request>,
    queued: HashSet<(ClientId, RequestId)>,
    // Highest request id that has left the queue in an ordered batch, per client.
    last_ordered: HashMap<ClientId, RequestId>,
    // Highest request id admitted, queued or ordered, per client.
    last_admitted: HashMap<ClientId, RequestId>,
}

impl ReqQueue {
    pub fn new() -> ReqQueue {
        ReqQueue {
            requests: VecDeque::new(),
            queued: HashSet::new(),
            last_ordered: HashMap::new(),
            last_admitted: HashMap::new(),
        }
    }

    /// Create an empty queue that treats every request up to the given id of each client as already
    /// ordered.
    pub fn with_ordered(ordered: impl IntoIterator<Item = (ClientId, RequestId)>) -> ReqQueue {
        let mut queue = ReqQueue::new();
        for (client, request_id) in ordered {
            queue.record_ordered(client, request_id);
        }
        queue
    }

    /// Enqueue an authenticated request. Ownership of the request transfers to the queue.
    ///
    /// # Errors
    ///
    /// - [`ReqQueueError::Duplicate`] if a request with the same `(client_id, request_id)` is already
    ///   queued.
    /// - [`ReqQueueError::Stale`] if a request from the same client with an equal or greater id has
    ///   already been queued or ordered.
    pub fn append(&mut self, request: Request) -> Result<(), ReqQueueError> {
        let client = request.client_id();
        let request_id = request.request_id();

        if self.queued.contains(&(client, request_id)) {
            return Err(ReqQueueError::Duplicate { client, request_id });
        }
        if let Some(last_admitted) = self.last_admitted.get(&client) {
            if request_id <= *last_admitted {
                return Err(ReqQueueError::Stale {
                    client,
                    request_id,
                    last_admitted: *last_admitted,
                });
            }
        }

        self.queued.insert((client, request_id));
        self.last_admitted.insert(client, request_id);
        self.requests.push_back(request);
        Ok(())
    }

    /// Remove and return up to `max` requests from the front of the queue, leaving the rest queued.
    pub fn take_prefix(&mut self, max: usize) -> Vec<Request> {
        let n = max.min(self.requests.len());
        let taken: Vec<Request> = self.requests.drain(..n).collect();
        for request in &taken {
            self.queued.remove(&(request.client_id(), request.request_id()));
            self.record_ordered(request.client_id(), request.request_id());
        }
        taken
    }

    /// Record that `(client, request_id)` was ordered by some batch, returning the matching request if it
    /// is queued. Queued requests from `client` with smaller ids can no longer be ordered, and are
    /// discarded.
    pub fn remove(&mut self, client: ClientId, request_id: RequestId) -> Option<Request> {
        self.record_ordered(client, request_id);

        self.queued.remove(&(client, request_id));
        let removed = self
            .requests
            .iter()
            .position(|request| request.client_id() == client && request.request_id() == request_id)
            .and_then(|pos| self.requests.remove(pos));

        let queued = &mut self.queued;
        self.requests.retain(|request| {
            let superseded = request.client_id() == client && request.request_id() < request_id;
            if superseded {
                queued.remove(&(client, request.request_id()));
            }
            !superseded
        });
        removed
    }

    /// Discard every queued request and forget which requests were admitted or ordered.
    pub fn clear(&mut self) {
        self.requests.clear();
        self.queued.clear();
        self.last_ordered.clear();
        self.last_admitted.clear();
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, client: ClientId, request_id: RequestId) -> bool {
        self.queued.contains(&(client, request_id))
    }

    /// Get the highest request id from `client` that has been ordered, if any.
    pub fn last_ordered(&self, client: ClientId) -> Option<RequestId> {
        self.last_ordered.get(&client).copied()
    }

    /// Get an iterator through the queued requests, front first.
    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, Request> {
        self.requests.iter()
    }

    fn record_ordered(&mut self, client: ClientId, request_id: RequestId) {
        raise(&mut self.last_ordered, client, request_id);
        raise(&mut self.last_admitted, client, request_id);
    }
}

fn raise(highest: &mut HashMap<ClientId, RequestId>, client: ClientId, request_id: RequestId) {
    match highest.entry(client) {
        hash_map::Entry::Occupied(mut e) => {
            if *e.get() < request_id {
                e.insert(request_id);
            }
        }
        hash_map::Entry::Vacant(e) => {
            e.insert(request_id);
        }
    }
}

impl Default for ReqQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReqQueueError {
    /// A request with the same `(client_id, request_id)` is already queued.
    Duplicate { client: ClientId, request_id: RequestId },
    /// The client already had a request with an equal or greater id queued or ordered.
    Stale {
        client: ClientId,
        request_id: RequestId,
        last_admitted: RequestId,
    },
}

impl fmt::Display for ReqQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqQueueError::Duplicate { client, request_id } => {
                write!(f, "request {} from client {} is already queued", request_id, client)
            }
            ReqQueueError::Stale {
                client,
                request_id,
                last_admitted,
            } => write!(
                f,
                "request {} from client {} is stale: request {} was already received",
                request_id, client, last_admitted
            ),
        }
    }
}

impl std::error::Error for ReqQueueError {}
