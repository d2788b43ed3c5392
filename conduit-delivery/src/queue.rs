//! Bounded, time-aware delivery queue.
//!
//! Envelopes are ordered by the time they next become eligible, then by
//! arrival. A worker takes an envelope out with [`DeliveryQueue::dequeue_ready`]
//! and receives a [`Lease`]; the lease must be settled with
//! [`DeliveryQueue::requeue`] or [`DeliveryQueue::complete`]. A lease that is
//! dropped unsettled puts its envelope back untouched, so an envelope is never
//! attempted twice at the same time and never lost by a crashed worker.
//!
//! Leased envelopes count towards the queue length, so a requeue can never
//! overflow the queue.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conduit_common::{
    clock::Clock,
    envelope::{Envelope, EnvelopeId},
    internal,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Notify, futures::Notified};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is at capacity; the client should try again later.
    #[error("Queue is full ({capacity} messages)")]
    Full { capacity: usize },

    /// The envelope can never be delivered.
    #[error("Envelope rejected: {0}")]
    Rejected(String),
}

impl QueueError {
    /// Returns `true` if the sender may succeed by trying again later.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

type Key = (DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct State {
    pending: BTreeMap<Key, Envelope>,
    leased: usize,
    next_sequence: u64,
}

impl State {
    fn len(&self) -> usize {
        self.pending.len() + self.leased
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    capacity: usize,
    clock: Arc<dyn Clock>,
    ready: Notify,
}

impl Inner {
    /// Move a leased envelope back to pending. Both counts change under one
    /// lock so a concurrent enqueue never sees the slot as free.
    fn release(&self, sequence: u64, envelope: Envelope) {
        {
            let mut state = self.state.lock();
            state.leased = state.leased.saturating_sub(1);
            state
                .pending
                .insert((envelope.next_attempt_at(), sequence), envelope);
        }
        self.ready.notify_one();
    }
}

/// Shared handle to the delivery queue. Clones refer to the same queue.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                capacity,
                clock,
                ready: Notify::new(),
            }),
        }
    }

    /// Add a new envelope, eligible immediately.
    ///
    /// # Errors
    /// [`QueueError::Full`] when the queue holds `capacity` envelopes, queued
    /// or leased. [`QueueError::Rejected`] when the envelope has no recipients.
    pub fn enqueue(&self, mut envelope: Envelope) -> Result<EnvelopeId, QueueError> {
        if envelope.recipients().is_empty() {
            return Err(QueueError::Rejected("envelope has no recipients".to_string()));
        }

        let id = envelope.id();
        {
            let mut state = self.inner.state.lock();
            if state.len() >= self.inner.capacity {
                return Err(QueueError::Full {
                    capacity: self.inner.capacity,
                });
            }

            envelope.schedule(self.inner.clock.now());
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state
                .pending
                .insert((envelope.next_attempt_at(), sequence), envelope);
        }

        internal!(level = DEBUG, envelope = %id, "Envelope queued");
        self.inner.ready.notify_one();

        Ok(id)
    }

    /// Take the envelope that has been eligible the longest, if any is eligible now.
    pub fn dequeue_ready(&self) -> Option<Lease> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        let first = state.pending.first_key_value().map(|((at, _), _)| *at)?;
        if first > now {
            return None;
        }

        let ((_, sequence), envelope) = state.pending.pop_first()?;
        state.leased += 1;

        Some(Lease {
            envelope,
            sequence,
            settled: false,
            queue: Arc::clone(&self.inner),
        })
    }

    /// Put a leased envelope back after a failed attempt, one attempt older and
    /// eligible again after `delay`.
    pub fn requeue(&self, mut lease: Lease, delay: Duration) {
        debug_assert!(Arc::ptr_eq(&self.inner, &lease.queue));

        let mut envelope = lease.settle();
        envelope.record_attempt(self.inner.clock.now(), delay);

        self.inner.release(lease.sequence, envelope);
    }

    /// Remove a leased envelope from the queue for good.
    pub fn complete(&self, mut lease: Lease) -> Envelope {
        debug_assert!(Arc::ptr_eq(&self.inner, &lease.queue));

        let envelope = lease.settle();
        let mut state = self.inner.state.lock();
        state.leased = state.leased.saturating_sub(1);

        envelope
    }

    /// Remove and return every queued envelope older than `max_age`.
    ///
    /// Leased envelopes are left alone; their worker decides their fate.
    pub fn evict_expired(&self, max_age: Duration) -> Vec<Envelope> {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        let expired_keys = state
            .pending
            .iter()
            .filter(|(_, envelope)| envelope.is_expired(now, max_age))
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        expired_keys
            .into_iter()
            .filter_map(|key| state.pending.remove(&key))
            .collect()
    }

    /// When the next queued envelope becomes eligible
    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        self.inner
            .state
            .lock()
            .pending
            .first_key_value()
            .map(|((at, _), _)| *at)
    }

    /// Number of envelopes held, including leased ones
    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of envelopes currently leased to a worker
    pub fn leased(&self) -> usize {
        self.inner.state.lock().leased
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Copies of the queued (not leased) envelopes in dequeue order
    pub fn snapshot(&self) -> Vec<Envelope> {
        self.inner.state.lock().pending.values().cloned().collect()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Resolves after the next enqueue or requeue.
    ///
    /// A notification sent while nobody was waiting is kept for the next
    /// waiter, so an enqueue between two worker passes is never missed.
    pub fn notified(&self) -> Notified<'_> {
        self.inner.ready.notified()
    }
}

/// Exclusive claim on one envelope taken out of the queue.
#[derive(Debug)]
pub struct Lease {
    envelope: Envelope,
    sequence: u64,
    settled: bool,
    queue: Arc<Inner>,
}

impl Lease {
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn settle(&mut self) -> Envelope {
        self.settled = true;
        self.envelope.clone()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        internal!(
            level = WARN,
            envelope = %self.envelope.id(),
            "Lease dropped without an outcome, returning envelope to the queue"
        );

        self.queue.release(self.sequence, self.envelope.clone());
    }
}
