use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::clock;

/// Unique identifier assigned to every accepted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvelopeId(Ulid);

impl EnvelopeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for EnvelopeId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

/// One message in flight between the listener and the email API.
///
/// Envelopes are built once, at the end of `DATA`, and afterwards only the
/// delivery queue touches the retry bookkeeping (`attempts` and
/// `next_attempt_at`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    id: EnvelopeId,
    original_sender: String,
    sender: String,
    reply_to: String,
    recipients: Vec<String>,
    subject: Option<String>,
    body: Arc<[u8]>,
    enqueued_at: DateTime<Utc>,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

impl Envelope {
    /// Build a fresh envelope.
    ///
    /// `recipients` is de-duplicated case-insensitively, keeping the first
    /// spelling and the original order. The reply-to address is the original
    /// sender.
    #[must_use]
    pub fn new(
        original_sender: impl Into<String>,
        sender: impl Into<String>,
        recipients: impl IntoIterator<Item = String>,
        subject: Option<String>,
        body: impl Into<Arc<[u8]>>,
        now: DateTime<Utc>,
    ) -> Self {
        let original_sender = original_sender.into();
        let mut seen = HashSet::new();
        let recipients = recipients
            .into_iter()
            .filter(|rcpt| seen.insert(rcpt.to_ascii_lowercase()))
            .collect();

        Self {
            id: EnvelopeId::generate(),
            reply_to: original_sender.clone(),
            original_sender,
            sender: sender.into(),
            recipients,
            subject,
            body: body.into(),
            enqueued_at: now,
            attempts: 0,
            next_attempt_at: now,
        }
    }

    pub const fn id(&self) -> EnvelopeId {
        self.id
    }

    /// The `MAIL FROM` address given by the client
    pub fn original_sender(&self) -> &str {
        &self.original_sender
    }

    /// The canonical from-address the message is sent as
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub const fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    pub const fn next_attempt_at(&self) -> DateTime<Utc> {
        self.next_attempt_at
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        clock::elapsed(self.enqueued_at, now)
    }

    /// Whether the envelope has been around for longer than `max_age`
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at <= now
    }

    /// Set when the envelope next becomes eligible for delivery.
    pub fn schedule(&mut self, at: DateTime<Utc>) {
        self.next_attempt_at = at;
    }

    /// Count one more failed attempt and push the next one out by `delay`.
    pub fn record_attempt(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt_at = clock::after(now, delay);
    }
}
