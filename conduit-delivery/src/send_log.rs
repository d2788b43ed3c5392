//! Record of delivery outcomes.
//!
//! The send log is append-only and keeps entries for the configured retention
//! window. Old entries are purged lazily whenever the log is appended to or
//! read, and periodically by the delivery workers.

use std::{
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use conduit_common::{
    clock::{self, Clock},
    envelope::{Envelope, EnvelopeId},
};
use parking_lot::Mutex;

use crate::error::{DeliveryError, ErrorClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Sent,
    Requeued,
    FailedPermanent,
    Expired,
}

impl Outcome {
    /// Terminal outcomes end the envelope's life
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Requeued)
    }
}

impl Display for Outcome {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Sent => "sent",
            Self::Requeued => "requeued",
            Self::FailedPermanent => "failed-permanent",
            Self::Expired => "expired",
        })
    }
}

/// The failure behind a non-`sent` outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&DeliveryError> for LoggedError {
    fn from(error: &DeliveryError) -> Self {
        Self {
            class: error.class(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendLogEntry {
    pub timestamp: DateTime<Utc>,
    pub envelope_id: EnvelopeId,
    /// The original sender, which the message carries as its reply-to
    pub from: String,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub attempt: u32,
    pub outcome: Outcome,
    pub error: Option<LoggedError>,
}

impl SendLogEntry {
    /// An entry for `envelope`, numbering the attempt that just finished.
    #[must_use]
    pub fn new(envelope: &Envelope, outcome: Outcome, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            envelope_id: envelope.id(),
            from: envelope.reply_to().to_owned(),
            to: envelope.recipients().to_vec(),
            subject: envelope.subject().map(ToOwned::to_owned),
            attempt: envelope.attempts().saturating_add(1),
            outcome,
            error: None,
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: &DeliveryError) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug)]
struct Inner {
    entries: Mutex<VecDeque<SendLogEntry>>,
    enabled: bool,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

/// Shared handle to the send log. Clones refer to the same log.
#[derive(Debug, Clone)]
pub struct SendLog {
    inner: Arc<Inner>,
}

impl SendLog {
    #[must_use]
    pub fn new(enabled: bool, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(VecDeque::new()),
                enabled,
                retention,
                clock,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    /// Record an outcome. Ignored when the log is disabled.
    pub fn append(&self, entry: SendLogEntry) {
        if !self.inner.enabled {
            return;
        }

        let mut entries = self.inner.entries.lock();
        self.purge_locked(&mut entries);
        entries.push_back(entry);
    }

    /// Copies of the retained entries, oldest first
    pub fn entries(&self) -> Vec<SendLogEntry> {
        let mut entries = self.inner.entries.lock();
        self.purge_locked(&mut entries);
        entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        self.purge_locked(&mut entries);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Drop entries older than the retention window, returning how many went.
    pub fn purge(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        self.purge_locked(&mut entries)
    }

    fn purge_locked(&self, entries: &mut VecDeque<SendLogEntry>) -> usize {
        let now = self.inner.clock.now();
        let before = entries.len();

        // Appends are in time order, so expired entries are all at the front.
        while entries
            .front()
            .is_some_and(|entry| clock::elapsed(entry.timestamp, now) > self.inner.retention)
        {
            entries.pop_front();
        }

        before - entries.len()
    }
}
