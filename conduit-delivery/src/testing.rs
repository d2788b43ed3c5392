//! Test doubles for the delivery path.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use conduit_common::envelope::Envelope;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    error::{DeliveryError, PermanentError, TransientError},
    sender::{EmailSender, SendReceipt},
};

/// One scripted response of a [`ScriptedSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    Accept,
    Transient(String),
    Permanent(String),
    /// Never answer, leaving the worker's send timeout to fire
    Hang,
}

/// An in-memory [`EmailSender`] that answers from a script.
///
/// Once the script runs out every send is accepted.
#[derive(Debug, Default)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<Scripted>>,
    attempted: Mutex<Vec<Envelope>>,
    delivered: Mutex<Vec<Envelope>>,
    notify: Notify,
}

impl ScriptedSender {
    pub fn new(script: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Append further responses to the script
    pub fn push(&self, response: Scripted) {
        self.script.lock().push_back(response);
    }

    /// Number of send calls made so far
    pub fn attempts(&self) -> usize {
        self.attempted.lock().len()
    }

    /// Every envelope that was accepted
    pub fn delivered(&self) -> Vec<Envelope> {
        self.delivered.lock().clone()
    }

    /// Wait for at least `expected` accepted envelopes, with timeout
    ///
    /// # Errors
    /// Returns an error if the timeout is reached before the expected count
    pub async fn wait_for_deliveries(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> Result<(), tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.delivered.lock().len() >= expected {
                    return;
                }
                notified.await;
            }
        })
        .await
    }
}

#[async_trait]
impl EmailSender for ScriptedSender {
    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, DeliveryError> {
        self.attempted.lock().push(envelope.clone());
        let response = self.script.lock().pop_front().unwrap_or(Scripted::Accept);

        match response {
            Scripted::Accept => {
                self.delivered.lock().push(envelope.clone());
                self.notify.notify_waiters();
                Ok(SendReceipt {
                    operation_id: Some(envelope.id().to_string()),
                })
            }
            Scripted::Transient(message) => Err(TransientError::Connection(message).into()),
            Scripted::Permanent(message) => Err(PermanentError::Rejected {
                status: 400,
                message,
            }
            .into()),
            Scripted::Hang => std::future::pending().await,
        }
    }
}
