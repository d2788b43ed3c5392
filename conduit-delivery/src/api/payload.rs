//! JSON body of an email send request.

use std::collections::BTreeMap;

use conduit_common::envelope::Envelope;
use mailparse::{DispositionType, ParsedMail};
use serde::Serialize;

use crate::error::ApiError;

/// Header added to every relayed message
pub const RELAY_HEADER: (&str, &str) = ("X-Conduit-Relay", "conduit");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailAddress {
    pub address: String,
}

impl From<&str> for EmailAddress {
    fn from(address: &str) -> Self {
        Self {
            address: address.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailContent {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plain_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailRecipients {
    pub to: Vec<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
    pub sender_address: String,
    pub content: EmailContent,
    pub recipients: EmailRecipients,
    /// Empty for bounces, which carry a null reverse-path
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reply_to: Vec<EmailAddress>,
    pub headers: BTreeMap<String, String>,
}

impl EmailMessage {
    /// Build the request body for `envelope`.
    ///
    /// The body is taken from the first inline `text/html` part when the
    /// message has one, and from the first inline `text/plain` part otherwise.
    ///
    /// # Errors
    /// If the stored message cannot be parsed as MIME
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ApiError> {
        let parsed = mailparse::parse_mail(envelope.body())
            .map_err(|err| ApiError::Payload(err.to_string()))?;

        let mut bodies = Bodies::default();
        bodies.collect(&parsed)?;

        let content = match (bodies.html, bodies.plain) {
            (Some(html), _) => EmailContent {
                subject: envelope.subject().unwrap_or_default().to_owned(),
                plain_text: None,
                html: Some(html),
            },
            (None, plain) => EmailContent {
                subject: envelope.subject().unwrap_or_default().to_owned(),
                plain_text: Some(plain.unwrap_or_default()),
                html: None,
            },
        };

        Ok(Self {
            sender_address: envelope.sender().to_owned(),
            content,
            recipients: EmailRecipients {
                to: envelope
                    .recipients()
                    .iter()
                    .map(|rcpt| EmailAddress::from(rcpt.as_str()))
                    .collect(),
            },
            reply_to: Some(envelope.reply_to())
                .filter(|reply_to| !reply_to.is_empty())
                .map(EmailAddress::from)
                .into_iter()
                .collect(),
            headers: BTreeMap::from([(RELAY_HEADER.0.to_owned(), RELAY_HEADER.1.to_owned())]),
        })
    }
}

#[derive(Default)]
struct Bodies {
    html: Option<String>,
    plain: Option<String>,
}

impl Bodies {
    fn collect(&mut self, part: &ParsedMail<'_>) -> Result<(), ApiError> {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                self.collect(sub)?;
            }
            return Ok(());
        }

        if part.get_content_disposition().disposition == DispositionType::Attachment {
            return Ok(());
        }

        let slot = match part.ctype.mimetype.to_ascii_lowercase().as_str() {
            "text/html" => &mut self.html,
            "text/plain" => &mut self.plain,
            _ => return Ok(()),
        };

        if slot.is_none() {
            *slot = Some(
                part.get_body()
                    .map_err(|err| ApiError::Payload(err.to_string()))?,
            );
        }

        Ok(())
    }
}
