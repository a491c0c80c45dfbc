//! Request sequencing and response correlation.
//!
//! Both types live inside the supervisor task and are only ever touched
//! from there, so neither carries a lock. Sequence numbers follow the
//! gateway convention: start at 2, step by 2, and keep counting across
//! reconnects so a stale reply from a dead connection can never be
//! mistaken for the answer to a new request.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::auth::AuthStage;
use crate::errors::NdaxError;
use crate::subscriptions::TopicKey;

/// Issues unique, strictly increasing request ids.
#[derive(Debug)]
pub(crate) struct SequenceAllocator {
    next: u64,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self { next: 2 }
    }

    pub fn allocate(&mut self) -> u64 {
        let id = self.next;
        self.next += 2;
        id
    }
}

/// Who is waiting on a correlated reply.
#[derive(Debug)]
pub(crate) enum Responder {
    /// An application caller blocked on `call()`.
    Caller(oneshot::Sender<Result<Value, NdaxError>>),
    /// An authentication handshake step; the reply feeds the sequencer.
    Auth(AuthStage),
    /// A subscribe request; the reply is the initial snapshot and the
    /// activation ack for the topic.
    Subscription(TopicKey),
    /// An unsubscribe request; the reply finalizes topic removal.
    Unsubscribe(TopicKey),
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub method: String,
    pub sent_at: Instant,
    pub responder: Responder,
}

/// Correlates outgoing requests with their eventual single-shot replies.
#[derive(Debug)]
pub(crate) struct PendingRequestTable {
    entries: HashMap<u64, PendingRequest>,
    timeout: Duration,
}

impl PendingRequestTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn insert(&mut self, sequence: u64, method: impl Into<String>, responder: Responder) {
        let prior = self.entries.insert(
            sequence,
            PendingRequest {
                method: method.into(),
                sent_at: Instant::now(),
                responder,
            },
        );
        debug_assert!(prior.is_none(), "sequence id reused while pending");
    }

    /// Remove and return the entry for a reply. `None` means a late or
    /// duplicate reply; the caller logs and drops it.
    pub fn resolve(&mut self, sequence: u64) -> Option<PendingRequest> {
        self.entries.remove(&sequence)
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.entries.contains_key(&sequence)
    }

    /// Sweep out entries older than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<(u64, PendingRequest)> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Remove everything, for teardown and connection loss.
    pub fn drain(&mut self) -> Vec<(u64, PendingRequest)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
