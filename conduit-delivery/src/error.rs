//! Typed error handling for delivery operations.
//!
//! Failures are split by class so the send log can record whether retrying
//! could plausibly help:
//! - Transient failures (timeouts, network errors, API 5xx and 429)
//! - Permanent failures (rejected credentials, rejected requests, failed operations)
//!
//! The retry policy itself treats both classes the same way.

use std::time::Duration;

use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Failure that may succeed on a later attempt.
    #[error("Temporary failure: {0}")]
    Transient(#[from] TransientError),

    /// Failure that is not expected to succeed on a later attempt.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),
}

#[derive(Debug, Error)]
pub enum TransientError {
    /// The send did not finish within the send timeout.
    #[error("Send timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The API could not be reached.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The API answered with a server error.
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The API asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

#[derive(Debug, Error)]
pub enum PermanentError {
    /// Credentials were rejected or a token could not be obtained.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The API rejected the request itself.
    #[error("Request rejected {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The send operation reached a terminal non-success status.
    #[error("Send operation {status}: {message}")]
    OperationFailed { status: String, message: String },

    /// The stored message could not be turned into an API request.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Errors raised by the email API client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid access key: {0}")]
    InvalidKey(String),

    #[error("Token request failed: {0}")]
    Token(String),

    #[error("Operation {status}: {message}")]
    Operation { status: String, message: String },

    #[error("Unable to build message payload: {0}")]
    Payload(String),
}

/// Whether a failure was transient or permanent in class, as recorded in the
/// send log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl DeliveryError {
    /// Returns `true` if this error is transient.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if this error is permanent.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Transient(_) => ErrorClass::Transient,
            Self::Permanent(_) => ErrorClass::Permanent,
        }
    }
}

/// Classify API failures.
///
/// - Network level errors, 408, 429 and 5xx are transient
/// - 401 and 403, and token failures, are authentication failures
/// - Any other 4xx is a rejection of the request
/// - A failed or cancelled send operation is permanent
impl From<ApiError> for DeliveryError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Http(err) if err.is_builder() => {
                Self::Permanent(PermanentError::InvalidMessage(err.to_string()))
            }
            ApiError::Http(err) => Self::Transient(TransientError::Connection(err.to_string())),
            ApiError::Status { status: 429, body } => {
                Self::Transient(TransientError::RateLimited(body))
            }
            ApiError::Status { status, body } if status == 408 || status >= 500 => {
                Self::Transient(TransientError::Server {
                    status,
                    message: body,
                })
            }
            ApiError::Status {
                status: 401 | 403,
                body,
            } => Self::Permanent(PermanentError::Authentication(body)),
            ApiError::Status { status, body } => Self::Permanent(PermanentError::Rejected {
                status,
                message: body,
            }),
            ApiError::InvalidKey(msg) | ApiError::Token(msg) => {
                Self::Permanent(PermanentError::Authentication(msg))
            }
            ApiError::Operation { status, message } => {
                Self::Permanent(PermanentError::OperationFailed { status, message })
            }
            ApiError::Payload(msg) => Self::Permanent(PermanentError::InvalidMessage(msg)),
        }
    }
}
