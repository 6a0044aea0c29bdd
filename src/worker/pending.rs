//! In-flight request bookkeeping for one worker
//!
//! Every entry leaves the table exactly once: by response delivery, by
//! deadline expiry, or by draining on connection loss. Removal hands the
//! entry back by value, so its reply can only be used once.

use crate::error::PushError;
use crate::request::{Delivery, DeliveryTx, RequestId, Response};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Where the outcome of a request goes
#[derive(Debug)]
pub(crate) enum Reply {
    Sync(oneshot::Sender<Result<Response, PushError>>),
    Async(DeliveryTx),
}

impl Reply {
    pub(crate) fn deliver(self, request_id: RequestId, result: Result<Response, PushError>) {
        // A caller that went away no longer wants the outcome
        match self {
            Reply::Sync(tx) => {
                let _ = tx.send(result);
            }
            Reply::Async(tx) => {
                let _ = tx.send(Delivery { request_id, result });
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct Pending {
    pub reply: Reply,
    pub deadline: Instant,
    pub stream_id: Option<u32>,
    exchange: Option<AbortHandle>,
}

impl Pending {
    pub(crate) fn new(reply: Reply, deadline: Instant, exchange: Option<AbortHandle>) -> Self {
        Self {
            reply,
            deadline,
            stream_id: None,
            exchange,
        }
    }

    /// Resolve the entry, abandoning its stream if it is still open
    pub(crate) fn resolve(self, request_id: RequestId, result: Result<Response, PushError>) {
        if let Some(exchange) = &self.exchange {
            exchange.abort();
        }
        self.reply.deliver(request_id, result);
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    entries: HashMap<RequestId, Pending>,
    deadlines: BTreeSet<(Instant, RequestId)>,
}

impl PendingTable {
    pub(crate) fn insert(&mut self, id: RequestId, pending: Pending) {
        self.deadlines.insert((pending.deadline, id));
        if let Some(previous) = self.entries.insert(id, pending) {
            self.deadlines.remove(&(previous.deadline, id));
        }
    }

    pub(crate) fn remove(&mut self, id: RequestId) -> Option<Pending> {
        let pending = self.entries.remove(&id)?;
        self.deadlines.remove(&(pending.deadline, id));
        Some(pending)
    }

    pub(crate) fn set_stream_id(&mut self, id: RequestId, stream_id: u32) -> bool {
        match self.entries.get_mut(&id) {
            Some(pending) => {
                pending.stream_id = Some(stream_id);
                true
            }
            None => false,
        }
    }

    /// Earliest deadline among pending requests
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Remove and return every entry whose deadline is at or before `now`
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(RequestId, Pending)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(pending) = self.entries.remove(&id) {
                expired.push((id, pending));
            }
        }
        expired
    }

    /// Remove and return every entry
    pub(crate) fn drain(&mut self) -> Vec<(RequestId, Pending)> {
        self.deadlines.clear();
        self.entries.drain().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
