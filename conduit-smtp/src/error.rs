//! Error types for the SMTP side of the relay.

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use thiserror::Error;

/// Errors ending a single client session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Reading from or writing to the client failed.
    #[error("Connection error: {0}")]
    Connection(#[from] io::Error),

    /// The client sent nothing for longer than the command timeout.
    #[error("Client idle for more than {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Errors from the listener itself. Any of these ends the listener unit and
/// is handled by the supervisor.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Unable to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Why a recipient was refused. Never retried; nothing is queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// The peer is outside every permitted subnet. Ends the session.
    #[error("{0} not permitted")]
    Source(IpAddr),

    /// The recipient's domain is not relayed. Only this recipient is refused.
    #[error("not relaying to that domain")]
    Domain(String),
}

impl VerifyError {
    pub const fn closes_session(&self) -> bool {
        matches!(self, Self::Source(_))
    }
}

/// Reasons a received message cannot be turned into an envelope.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("No valid recipients")]
    NoRecipients,

    #[error("Malformed header line: {0}")]
    MalformedHeader(String),

    #[error("Unable to parse headers: {0}")]
    Parse(#[from] mailparse::MailParseError),
}
