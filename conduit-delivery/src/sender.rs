use async_trait::async_trait;
use conduit_common::envelope::Envelope;

use crate::error::DeliveryError;

/// Acknowledgement from the email service for one accepted message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Service-side identifier of the send operation, if one was returned
    pub operation_id: Option<String>,
}

/// The outbound collaborator the delivery worker hands envelopes to.
#[async_trait]
pub trait EmailSender: Send + Sync + std::fmt::Debug {
    /// Submit `envelope` and wait for the service to accept or reject it.
    ///
    /// # Errors
    /// Any failure to get the message accepted, classified as transient or
    /// permanent.
    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, DeliveryError>;
}
