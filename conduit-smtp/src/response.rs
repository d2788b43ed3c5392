use core::fmt::{self, Display, Formatter};

use conduit_common::status::Status;

/// A reply sent to the client: a status code with one or more lines of text.
///
/// Renders with `-` continuations on every line but the last, each line
/// terminated by CRLF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: Status,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(status: Status, line: impl Into<String>) -> Self {
        Self {
            status,
            lines: vec![line.into()],
        }
    }

    pub fn multiline<I, L>(status: Status, lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        let mut lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            lines.push(String::new());
        }

        Self { status, lines }
    }

    pub const fn status(&self) -> Status {
        self.status
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        let last = self.lines.len().saturating_sub(1);
        for (idx, line) in self.lines.iter().enumerate() {
            let separator = if idx == last { ' ' } else { '-' };
            if line.is_empty() && idx == last {
                write!(fmt, "{}\r\n", self.status)?;
            } else {
                write!(fmt, "{}{separator}{line}\r\n", self.status)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn single_line() {
        assert_eq!(Reply::new(Status::Ok, "Ok").to_string(), "250 Ok\r\n");
    }

    #[test]
    fn multi_line() {
        let reply = Reply::multiline(Status::Ok, ["relay.lan", "8BITMIME", "SIZE 1024"]);
        assert_eq!(
            reply.to_string(),
            "250-relay.lan\r\n250-8BITMIME\r\n250 SIZE 1024\r\n"
        );
    }

    #[test]
    fn empty_multiline_still_renders_a_line() {
        assert_eq!(
            Reply::multiline(Status::Ok, Vec::<String>::new()).to_string(),
            "250\r\n"
        );
    }
}
