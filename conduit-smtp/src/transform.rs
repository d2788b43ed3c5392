//! Rewriting of accepted messages into relay envelopes.
//!
//! The API only sends from a verified address, so the message's `From` is
//! replaced with the relay's configured sender and the address the client
//! used in `MAIL FROM` goes into `Reply-To`. Everything outside the header
//! block is passed through byte for byte.

use std::sync::Arc;

use conduit_common::{clock::Clock, envelope::Envelope};
use mailparse::MailHeaderMap;

use crate::error::TransformError;

#[derive(Debug, Clone)]
pub struct Transformer {
    from_address: String,
    clock: Arc<dyn Clock>,
}

/// Split `raw` at the first empty line. The header block keeps its final line
/// terminator; the remainder starts with the empty line.
fn split_header_block(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut offset = 0;
    for line in raw.split_inclusive(|&b| b == b'\n') {
        if line == b"\r\n" || line == b"\n" {
            return raw.split_at(offset);
        }
        offset += line.len();
    }

    (raw, &[])
}

/// Group the header block into whole fields, continuation lines included.
fn header_fields(block: &[u8]) -> Result<Vec<&[u8]>, TransformError> {
    let mut fields: Vec<&[u8]> = Vec::new();
    let mut start = None;
    let mut offset = 0;

    for line in block.split_inclusive(|&b| b == b'\n') {
        let folded = matches!(line.first(), Some(b' ' | b'\t'));

        if folded {
            if start.is_none() {
                return Err(TransformError::MalformedHeader(
                    String::from_utf8_lossy(line).trim().to_string(),
                ));
            }
        } else {
            if !line.contains(&b':') {
                return Err(TransformError::MalformedHeader(
                    String::from_utf8_lossy(line).trim().to_string(),
                ));
            }

            if let Some(begin) = start.replace(offset) {
                fields.push(&block[begin..offset]);
            }
        }

        offset += line.len();
    }

    if let Some(begin) = start {
        fields.push(&block[begin..]);
    }

    Ok(fields)
}

fn field_name(field: &[u8]) -> &[u8] {
    field
        .iter()
        .position(|&b| b == b':')
        .map_or(field, |colon| field[..colon].trim_ascii())
}

impl Transformer {
    pub fn new(from_address: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            from_address: from_address.into(),
            clock,
        }
    }

    pub fn from_address(&self) -> &str {
        &self.from_address
    }

    /// Rewrite `raw` and wrap it in a new envelope addressed to `recipients`.
    ///
    /// `original_sender` is the `MAIL FROM` address, empty for a null
    /// reverse-path, in which case no `Reply-To` is written.
    ///
    /// # Errors
    /// If there are no recipients or the header block cannot be parsed
    pub fn transform(
        &self,
        raw: &[u8],
        original_sender: &str,
        recipients: &[String],
    ) -> Result<Envelope, TransformError> {
        if recipients.is_empty() {
            return Err(TransformError::NoRecipients);
        }

        let (block, rest) = split_header_block(raw);
        let fields = header_fields(block)?;
        let (headers, _) = mailparse::parse_headers(block)?;
        let subject = headers.get_first_value("Subject");

        let mut rewritten = Vec::with_capacity(raw.len() + 128);
        let mut wrote_from = false;

        for field in fields {
            let name = field_name(field);
            if name.eq_ignore_ascii_case(b"From") {
                if !wrote_from {
                    rewritten.extend_from_slice(format!("From: {}\r\n", self.from_address).as_bytes());
                    wrote_from = true;
                }
                continue;
            }

            if name.eq_ignore_ascii_case(b"Reply-To") {
                continue;
            }

            rewritten.extend_from_slice(field);
            if !field.ends_with(b"\n") {
                rewritten.extend_from_slice(b"\r\n");
            }
        }

        if !wrote_from {
            rewritten.extend_from_slice(format!("From: {}\r\n", self.from_address).as_bytes());
        }

        if !original_sender.is_empty() {
            rewritten.extend_from_slice(format!("Reply-To: {original_sender}\r\n").as_bytes());
        }

        rewritten.extend_from_slice(rest);

        Ok(Envelope::new(
            original_sender,
            self.from_address.as_str(),
            recipients.iter().cloned(),
            subject,
            rewritten,
            self.clock.now(),
        ))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::{TimeZone, Utc};
    use conduit_common::clock::ManualClock;
    use pretty_assertions::assert_eq;

    use super::*;

    fn transformer() -> Transformer {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        Transformer::new("relay@example.com", Arc::new(clock))
    }

    fn rcpts(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn text(envelope: &Envelope) -> String {
        String::from_utf8(envelope.body().to_vec()).unwrap()
    }

    #[test]
    fn from_is_rewritten_and_reply_to_added() {
        let raw = b"From: User <user@lan>\r\nTo: ops@example.com\r\nSubject: Disk full\r\n\r\nFrom the body\r\n";
        let envelope = transformer()
            .transform(raw, "user@lan", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(
            text(&envelope),
            "From: relay@example.com\r\nTo: ops@example.com\r\nSubject: Disk full\r\nReply-To: user@lan\r\n\r\nFrom the body\r\n"
        );
        assert_eq!(envelope.sender(), "relay@example.com");
        assert_eq!(envelope.original_sender(), "user@lan");
        assert_eq!(envelope.reply_to(), "user@lan");
        assert_eq!(envelope.subject(), Some("Disk full"));
        assert_eq!(envelope.recipients(), ["ops@example.com"]);
    }

    #[test]
    fn missing_from_is_inserted() {
        let raw = b"To: ops@example.com\r\n\r\nbody\r\n";
        let envelope = transformer()
            .transform(raw, "user@lan", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(
            text(&envelope),
            "To: ops@example.com\r\nFrom: relay@example.com\r\nReply-To: user@lan\r\n\r\nbody\r\n"
        );
        assert_eq!(envelope.subject(), None);
    }

    #[test]
    fn existing_reply_to_and_folded_from_are_replaced() {
        let raw = b"From: A very long display name\r\n <user@lan>\r\nReply-To: someone@else\r\nSubject: Folded\r\n  subject\r\n\r\nbody";
        let envelope = transformer()
            .transform(raw, "user@lan", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(
            text(&envelope),
            "From: relay@example.com\r\nSubject: Folded\r\n  subject\r\nReply-To: user@lan\r\n\r\nbody"
        );
        let subject = envelope.subject().unwrap();
        assert!(subject.starts_with("Folded"));
        assert!(subject.ends_with("subject"));
    }

    #[test]
    fn bare_newlines_are_preserved() {
        let raw = b"From: user@lan\nSubject: hi\n\nline one\nline two\n";
        let envelope = transformer()
            .transform(raw, "user@lan", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(
            text(&envelope),
            "From: relay@example.com\r\nSubject: hi\nReply-To: user@lan\r\n\nline one\nline two\n"
        );
    }

    #[test]
    fn headers_only_message() {
        let raw = b"Subject: ping";
        let envelope = transformer()
            .transform(raw, "user@lan", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(
            text(&envelope),
            "Subject: ping\r\nFrom: relay@example.com\r\nReply-To: user@lan\r\n"
        );
    }

    #[test]
    fn null_sender_gets_no_reply_to() {
        let raw = b"Subject: bounce\r\n\r\nbody\r\n";
        let envelope = transformer()
            .transform(raw, "", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(
            text(&envelope),
            "Subject: bounce\r\nFrom: relay@example.com\r\n\r\nbody\r\n"
        );
    }

    #[test]
    fn encoded_subject_is_decoded() {
        let raw = b"Subject: =?UTF-8?B?SGVsbG8gd29ybGQ=?=\r\n\r\nbody\r\n";
        let envelope = transformer()
            .transform(raw, "user@lan", &rcpts(&["ops@example.com"]))
            .unwrap();

        assert_eq!(envelope.subject(), Some("Hello world"));
    }

    #[test]
    fn recipients_are_required() {
        let result = transformer().transform(b"Subject: x\r\n\r\n", "user@lan", &[]);
        assert!(matches!(result, Err(TransformError::NoRecipients)));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let result = transformer().transform(
            b"this is not a header\r\n\r\nbody",
            "user@lan",
            &rcpts(&["ops@example.com"]),
        );
        assert!(matches!(result, Err(TransformError::MalformedHeader(_))));

        let result = transformer().transform(
            b" leading continuation\r\nSubject: x\r\n\r\n",
            "user@lan",
            &rcpts(&["ops@example.com"]),
        );
        assert!(matches!(result, Err(TransformError::MalformedHeader(_))));
    }
}
