use chrono::{DateTime, Utc};
use conduit_common::envelope::Envelope;

pub const FAILURE_SUBJECT: &str = "SMTP RELAY SERVICE FAILURE";

/// Build the report sent to the operator after the relay restarted itself.
///
/// The report goes through the normal delivery queue, from the relay's own
/// sender address.
pub fn failure_report(from: &str, to: &str, at: DateTime<Utc>, error: &str) -> Envelope {
    let body = format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {FAILURE_SUBJECT}\r\n\
         Date: {date}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         The SMTP relay service failed at {time} and has been restarted.\r\n\
         \r\n\
         Error: {error}\r\n",
        date = at.to_rfc2822(),
        time = at.to_rfc3339(),
    );

    Envelope::new(
        from,
        from,
        [to.to_owned()],
        Some(FAILURE_SUBJECT.to_owned()),
        body.into_bytes(),
        at,
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn report_contents() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let report = failure_report("relay@example.com", "ops@example.com", at, "bind failed");

        assert_eq!(report.subject(), Some(FAILURE_SUBJECT));
        assert_eq!(report.recipients(), ["ops@example.com"]);
        assert_eq!(report.sender(), "relay@example.com");
        assert_eq!(report.enqueued_at(), at);

        let body = String::from_utf8(report.body().to_vec()).unwrap();
        assert!(body.contains("Subject: SMTP RELAY SERVICE FAILURE\r\n"));
        assert!(body.contains("2024-05-01T12:00:00+00:00"));
        assert!(body.ends_with("Error: bind failed\r\n"));
    }
}
