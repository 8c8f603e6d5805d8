//! Request correlation and batching
//!
//! The [`CorrelationTable`] assigns correlation ids, owns every
//! [`PendingRequest`], and routes responses back to their waiters strictly
//! by id. It lives inside the connection manager's single state lock and
//! is never exposed to callers.
//!
//! Requests move through two queues before they reach the wire:
//!
//! - the **outbox** collects requests issued while the connection is ready;
//!   it is drained by the coalescing flush ([`BatchPolicy`]).
//! - the **degraded queue** holds requests issued while the connection is
//!   recovering; it is drained in FIFO order once a new connection is
//!   negotiated.
//!
//! A pending entry is resolved exactly once: by its response, by deadline
//! expiry, by cancellation, or by connection loss. Whichever happens first
//! removes the entry, so every later outcome finds nothing to resolve.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::Envelope;
use crate::error::CapwireError;

/// Outcome delivered to a waiting caller.
pub type Outcome = std::result::Result<Value, CapwireError>;

/// Coalescing window for outgoing requests: a flush happens when the
/// window elapses or when `max_size` requests are waiting, whichever comes
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub window: Duration,
    pub max_size: usize,
}

impl BatchPolicy {
    pub fn new(window: Duration, max_size: usize) -> Self {
        Self {
            window,
            max_size: max_size.max(1),
        }
    }

    /// Whether `waiting` requests should be flushed without waiting for the
    /// window.
    pub fn is_full(&self, waiting: usize) -> bool {
        waiting >= self.max_size
    }
}

/// An in-flight request owned by the correlation table.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub method: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    /// How many times the request was replayed after a reconnect.
    pub retry_count: u32,
    /// Whether the request has been written to a connection.
    pub transmitted: bool,
    /// Connection generation the request was last written on.
    pub generation: u64,
    /// Kept so the request can be retransmitted.
    pub envelope: Envelope,
    responder: oneshot::Sender<Outcome>,
}

impl PendingRequest {
    fn resolve(self, outcome: Outcome) {
        // The waiter may already be gone; that is not an error.
        let _ = self.responder.send(outcome);
    }
}

/// What happened to an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A waiting caller received it.
    Matched,
    /// The id belonged to a cancelled request; discarded silently.
    Abandoned,
    /// Nothing was waiting for this id.
    Unknown,
}

/// Correlation id -> pending request table plus the outgoing queues.
#[derive(Debug)]
pub struct CorrelationTable {
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
    /// Cancelled or expired after transmission, with the instant past which
    /// a late response is no longer expected.
    abandoned: HashMap<u64, Instant>,
    outbox: VecDeque<u64>,
    queued: VecDeque<u64>,
    flush_scheduled: bool,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            abandoned: HashMap::new(),
            outbox: VecDeque::new(),
            queued: VecDeque::new(),
            flush_scheduled: false,
        }
    }

    /// Allocate the next correlation id. Ids are never reused within a
    /// session.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Create a pending entry for a new request.
    pub fn register(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
        now: Instant,
    ) -> (u64, oneshot::Receiver<Outcome>) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                issued_at: now,
                deadline: now + timeout,
                timeout,
                retry_count: 0,
                transmitted: false,
                generation: 0,
                envelope: Envelope::request(id, method, params),
                responder: tx,
            },
        );
        (id, rx)
    }

    /// Mark a registered entry as sent directly (outside the queues).
    pub fn mark_transmitted(&mut self, id: u64, generation: u64) -> Option<Envelope> {
        let entry = self.pending.get_mut(&id)?;
        entry.transmitted = true;
        entry.generation = generation;
        Some(entry.envelope.clone())
    }

    pub fn push_outbox(&mut self, id: u64) -> usize {
        self.outbox.push_back(id);
        self.outbox.len()
    }

    pub fn push_queued(&mut self, id: u64) -> usize {
        self.queued.push_back(id);
        self.queued.len()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&PendingRequest> {
        self.pending.get(&id)
    }

    /// Claim the right to schedule the window timer. Returns `false` if a
    /// flush is already scheduled.
    pub fn schedule_flush(&mut self) -> bool {
        !std::mem::replace(&mut self.flush_scheduled, true)
    }

    pub fn clear_flush_schedule(&mut self) {
        self.flush_scheduled = false;
    }

    /// Pop up to `max` outbox entries for transmission on `generation`.
    pub fn take_outbox(&mut self, max: usize, generation: u64) -> Vec<(u64, Envelope)> {
        Self::take_from(&mut self.outbox, &mut self.pending, max, generation)
    }

    /// Pop up to `max` degraded-queue entries, oldest first.
    pub fn take_queued(&mut self, max: usize, generation: u64) -> Vec<(u64, Envelope)> {
        Self::take_from(&mut self.queued, &mut self.pending, max, generation)
    }

    fn take_from(
        queue: &mut VecDeque<u64>,
        pending: &mut HashMap<u64, PendingRequest>,
        max: usize,
        generation: u64,
    ) -> Vec<(u64, Envelope)> {
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(id) = queue.pop_front() else { break };
            // Entries resolved while queued (cancel, timeout) are skipped.
            if let Some(entry) = pending.get_mut(&id) {
                entry.transmitted = true;
                entry.generation = generation;
                batch.push((id, entry.envelope.clone()));
            }
        }
        batch
    }

    /// Put entries whose transmission failed back at the head of the
    /// degraded queue, keeping their relative order. Entries already settled
    /// or requeued since they were taken are left alone.
    pub fn requeue_front(&mut self, ids: &[u64]) {
        for id in ids.iter().rev() {
            if let Some(entry) = self.pending.get_mut(id).filter(|e| e.transmitted) {
                entry.transmitted = false;
                self.queued.push_front(*id);
            }
        }
    }

    /// Move everything waiting in the outbox to the back of the degraded
    /// queue.
    pub fn demote_outbox(&mut self) {
        let outbox = std::mem::take(&mut self.outbox);
        self.queued.extend(outbox);
        self.flush_scheduled = false;
    }

    /// Handle requests that were written to a connection older than
    /// `generation` and are still unanswered.
    ///
    /// With `replay`, they are queued again ahead of everything else (in id
    /// order) with their retry count bumped. Otherwise they resolve
    /// [`CapwireError::ConnectionLost`]. Returns how many were affected.
    pub fn settle_in_flight(&mut self, generation: u64, replay: bool, reason: &str) -> usize {
        let mut stale: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.transmitted && p.generation < generation)
            .map(|p| p.id)
            .collect();
        stale.sort_unstable();
        // Responses for anything abandoned on the old connection can no
        // longer arrive.
        self.abandoned.clear();

        if replay {
            for id in stale.iter().rev() {
                if let Some(entry) = self.pending.get_mut(id) {
                    entry.transmitted = false;
                    entry.retry_count += 1;
                    self.queued.push_front(*id);
                }
            }
        } else {
            for id in &stale {
                if let Some(entry) = self.pending.remove(id) {
                    entry.resolve(Err(CapwireError::ConnectionLost(reason.to_string())));
                }
            }
        }
        stale.len()
    }

    /// Route a response envelope to its waiter.
    pub fn resolve(&mut self, envelope: Envelope) -> Resolution {
        let Some(id) = envelope.id.as_ref().and_then(|id| id.as_u64()) else {
            return Resolution::Unknown;
        };
        if let Some(entry) = self.pending.remove(&id) {
            let outcome = match (envelope.result, envelope.error) {
                (_, Some(error)) => Err(error.into()),
                (Some(result), None) => Ok(result),
                (None, None) => Ok(Value::Null),
            };
            entry.resolve(outcome);
            return Resolution::Matched;
        }
        if self.abandoned.remove(&id).is_some() {
            return Resolution::Abandoned;
        }
        Resolution::Unknown
    }

    /// Remove an entry and resolve it with `error`. Transmitted entries are
    /// remembered as abandoned so their late response is dropped silently,
    /// for one more timeout period past their deadline.
    /// Returns `false` if the entry was already resolved.
    pub fn cancel(&mut self, id: u64, error: CapwireError) -> bool {
        let Some(entry) = self.pending.remove(&id) else {
            return false;
        };
        self.prune_abandoned(Instant::now());
        if entry.transmitted {
            self.abandoned.insert(id, entry.deadline + entry.timeout);
        }
        self.outbox.retain(|x| *x != id);
        self.queued.retain(|x| *x != id);
        entry.resolve(Err(error));
        true
    }

    /// Resolve every entry whose deadline has passed with
    /// [`CapwireError::Timeout`]. Returns the expired ids.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .pending
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.id)
            .collect();
        for id in &expired {
            if let Some(entry) = self.pending.get(id) {
                let error = CapwireError::Timeout {
                    method: entry.method.clone(),
                    timeout_ms: entry.timeout.as_millis() as u64,
                };
                self.cancel(*id, error);
            }
        }
        self.prune_abandoned(now);
        expired
    }

    /// Ids whose late response would still be dropped silently.
    pub fn abandoned_len(&self) -> usize {
        self.abandoned.len()
    }

    fn prune_abandoned(&mut self, now: Instant) {
        self.abandoned.retain(|_, forget_at| *forget_at > now);
    }

    /// Resolve every pending entry with [`CapwireError::ConnectionLost`] and
    /// empty both queues.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let drained: Vec<PendingRequest> = self.pending.drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for entry in drained {
            entry.resolve(Err(CapwireError::ConnectionLost(reason.to_string())));
        }
        self.outbox.clear();
        self.queued.clear();
        self.abandoned.clear();
        self.flush_scheduled = false;
        count
    }
}
