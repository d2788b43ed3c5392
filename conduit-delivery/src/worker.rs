//! Delivery worker.
//!
//! A worker drains ready envelopes from the [`DeliveryQueue`], hands each one
//! to the [`EmailSender`] under the send timeout and settles the lease
//! according to the [`RetryPolicy`]. Between passes it sleeps until the
//! earliest pending envelope becomes eligible, a new envelope is queued, or
//! shutdown is signalled.

use std::{sync::Arc, time::Duration};

use conduit_common::{Signal, clock, envelope::Envelope, internal, tracing};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::{
    error::{DeliveryError, TransientError},
    policy::{Decision, RetryPolicy},
    queue::{DeliveryQueue, Lease},
    send_log::{Outcome, SendLog, SendLogEntry},
    sender::EmailSender,
};

/// Longest a worker sleeps between passes, so expiry and log purging still
/// happen on an idle queue.
const MAX_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DeliveryWorker {
    id: usize,
    queue: DeliveryQueue,
    send_log: SendLog,
    sender: Arc<dyn EmailSender>,
    policy: RetryPolicy,
    send_timeout: Duration,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        queue: DeliveryQueue,
        send_log: SendLog,
        sender: Arc<dyn EmailSender>,
        policy: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id: 0,
            queue,
            send_log,
            sender,
            policy,
            send_timeout,
        }
    }

    /// Identify this worker in logs when several share a queue
    #[must_use]
    pub const fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Evict expired envelopes, then attempt every envelope that is ready now.
    ///
    /// Returns the number of send attempts made.
    pub async fn process_ready(&self) -> usize {
        self.drain(None).await.attempted
    }

    /// One pass over the ready envelopes. With a shutdown receiver the pass
    /// stops after the attempt in progress once shutdown has been signalled.
    async fn drain(&self, mut shutdown: Option<&mut broadcast::Receiver<Signal>>) -> Pass {
        self.evict_expired();
        self.send_log.purge();

        let mut pass = Pass::default();
        loop {
            if shutdown.as_deref_mut().is_some_and(shutdown_requested) {
                pass.interrupted = true;
                break;
            }
            let Some(lease) = self.queue.dequeue_ready() else {
                break;
            };

            // The clock moves while earlier envelopes in this pass are sent
            let now = self.queue.clock().now();
            if lease.envelope().is_expired(now, self.policy.max_age) {
                self.expired(lease.envelope(), now);
                self.queue.complete(lease);
                continue;
            }

            self.attempt(lease).await;
            pass.attempted += 1;
        }

        pass
    }

    fn evict_expired(&self) {
        let now = self.queue.clock().now();

        for envelope in self.queue.evict_expired(self.policy.max_age) {
            self.expired(&envelope, now);
        }
    }

    fn expired(&self, envelope: &Envelope, now: chrono::DateTime<chrono::Utc>) {
        tracing::warn!(
            worker = self.id,
            envelope = %envelope.id(),
            from = envelope.reply_to(),
            to = ?envelope.recipients(),
            subject = envelope.subject().unwrap_or_default(),
            "Discarding expired message"
        );
        self.send_log
            .append(SendLogEntry::new(envelope, Outcome::Expired, now));
    }

    async fn attempt(&self, lease: Lease) {
        let envelope = lease.envelope();
        internal!(
            level = DEBUG,
            worker = self.id,
            envelope = %envelope.id(),
            attempt = envelope.attempts() + 1,
            "Sending message"
        );

        let result = tokio::time::timeout(self.send_timeout, self.sender.send(envelope))
            .await
            .unwrap_or_else(|_| Err(TransientError::Timeout(self.send_timeout).into()));
        let now = self.queue.clock().now();

        match result {
            Ok(receipt) => {
                tracing::info!(
                    worker = self.id,
                    envelope = %envelope.id(),
                    from = envelope.reply_to(),
                    to = ?envelope.recipients(),
                    subject = envelope.subject().unwrap_or_default(),
                    operation = receipt.operation_id.as_deref().unwrap_or_default(),
                    "Message sent"
                );
                self.send_log
                    .append(SendLogEntry::new(envelope, Outcome::Sent, now));
                self.queue.complete(lease);
            }
            Err(error) => self.failed(lease, &error, now),
        }
    }

    fn failed(&self, lease: Lease, error: &DeliveryError, now: chrono::DateTime<chrono::Utc>) {
        let envelope = lease.envelope();

        match self.policy.decide(envelope, now) {
            Decision::Retry { delay } => {
                tracing::warn!(
                    worker = self.id,
                    envelope = %envelope.id(),
                    attempt = envelope.attempts() + 1,
                    retry_limit = self.policy.retry_limit,
                    "Send failed, requeueing message: {error}"
                );
                self.send_log.append(
                    SendLogEntry::new(envelope, Outcome::Requeued, now).with_error(error),
                );
                self.queue.requeue(lease, delay);
            }
            Decision::GiveUp(reason) => {
                tracing::error!(
                    worker = self.id,
                    envelope = %envelope.id(),
                    from = envelope.reply_to(),
                    to = ?envelope.recipients(),
                    subject = envelope.subject().unwrap_or_default(),
                    ?reason,
                    "Send failed, discarding message: {error}"
                );
                self.send_log.append(
                    SendLogEntry::new(envelope, Outcome::FailedPermanent, now).with_error(error),
                );
                self.queue.complete(lease);
            }
        }
    }

    /// Run until shutdown is signalled.
    ///
    /// An attempt in progress when shutdown arrives is finished first; the
    /// rest of the backlog stays queued.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(level = INFO, worker = self.id, "Delivery worker starting");

        loop {
            if self.drain(Some(&mut shutdown)).await.interrupted {
                internal!(level = INFO, worker = self.id, "Delivery worker received shutdown signal");
                break;
            }

            let now = self.queue.clock().now();
            let idle = self
                .queue
                .next_eligible_at()
                .map_or(MAX_IDLE, |at| clock::elapsed(now, at).min(MAX_IDLE));

            tokio::select! {
                () = self.queue.notified() => {}
                () = tokio::time::sleep(idle) => {}
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            internal!(level = INFO, worker = self.id, "Delivery worker received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!(worker = self.id, "Delivery worker shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        internal!(level = INFO, worker = self.id, "Delivery worker stopped");
    }
}

#[derive(Debug, Default)]
struct Pass {
    attempted: usize,
    interrupted: bool,
}

/// Whether shutdown was signalled, without waiting for it
fn shutdown_requested(shutdown: &mut broadcast::Receiver<Signal>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}
