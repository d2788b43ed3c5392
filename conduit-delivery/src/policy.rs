//! Retry policy applied after a failed send.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_common::{
    config::{DeliveryConfig, QueueConfig},
    envelope::Envelope,
};

/// What to do with an envelope whose send attempt just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Try again after `delay`
    Retry { delay: Duration },
    /// Drop the envelope
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    RetriesExhausted,
    TooOld,
}

/// Uniform retry policy.
///
/// Every failure is retried the same way regardless of its class, until the
/// retry limit is reached or the envelope is older than the maximum queue age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub max_age: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(delivery: &DeliveryConfig, queue: &QueueConfig) -> Self {
        Self {
            retry_limit: delivery.retry_limit,
            retry_delay: delivery.retry_delay,
            max_age: queue.max_age,
        }
    }

    /// Decide the fate of `envelope` after a failed attempt at `now`.
    ///
    /// `envelope.attempts()` counts the failures before this one.
    pub fn decide(&self, envelope: &Envelope, now: DateTime<Utc>) -> Decision {
        if envelope.attempts().saturating_add(1) > self.retry_limit {
            Decision::GiveUp(GiveUpReason::RetriesExhausted)
        } else if envelope.is_expired(now, self.max_age) {
            Decision::GiveUp(GiveUpReason::TooOld)
        } else {
            Decision::Retry {
                delay: self.retry_delay,
            }
        }
    }
}
