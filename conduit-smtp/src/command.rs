use core::fmt::{self, Display, Formatter};

use mailparse::MailAddr;

#[derive(PartialEq, PartialOrd, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    pub fn id(&self) -> &str {
        match self {
            Self::Ehlo(id) | Self::Helo(id) => id,
        }
    }

    pub const fn is_extended(&self) -> bool {
        matches!(self, Self::Ehlo(_))
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path (`MAIL FROM:<>`)
    MailFrom(Option<String>),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Help,
    Vrfy,
    Quit,
    /// A known command with missing or unparseable arguments
    Invalid(String),
    /// Anything that is not a command we know
    Unknown(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => write!(fmt, "{v} {}", v.id()),
            Self::MailFrom(from) => write!(fmt, "MAIL FROM:<{}>", from.as_deref().unwrap_or_default()),
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Help => fmt.write_str("HELP"),
            Self::Vrfy => fmt.write_str("VRFY"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Invalid(s) | Self::Unknown(s) => fmt.write_str(s),
        }
    }
}

/// Case-insensitively strip `prefix` from the start of `value`
fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    value
        .get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &value[prefix.len()..])
}

/// Extract the mailbox from a path argument such as `<user@example.com> SIZE=10`.
///
/// ESMTP parameters after the path are ignored. An empty path (`<>`) yields
/// `Ok(None)`.
fn parse_path(argument: &str) -> Result<Option<String>, String> {
    let path = argument
        .trim()
        .split_whitespace()
        .next()
        .ok_or_else(|| "Missing address".to_string())?;

    let bare = path
        .strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .unwrap_or(path)
        .trim();

    if bare.is_empty() {
        return Ok(None);
    }

    match mailparse::addrparse(bare) {
        Ok(list) => match list.first() {
            Some(MailAddr::Single(info)) if !info.addr.is_empty() => Ok(Some(info.addr.clone())),
            _ => Err(format!("Invalid address {bare}")),
        },
        Err(err) => Err(err.to_string()),
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();
        let verb = trimmed
            .split_once(char::is_whitespace)
            .map_or(trimmed, |(verb, _)| verb);

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "MAIL FROM:") {
            parse_path(rest).map(Self::MailFrom).map_err(Self::Invalid)
        } else if let Some(rest) = strip_prefix_ignore_case(trimmed, "RCPT TO:") {
            match parse_path(rest) {
                Ok(Some(rcpt)) => Ok(Self::RcptTo(rcpt)),
                Ok(None) => Err(Self::Invalid("Missing recipient".to_string())),
                Err(err) => Err(Self::Invalid(err)),
            }
        } else if verb.eq_ignore_ascii_case("EHLO") || verb.eq_ignore_ascii_case("HELO") {
            match trimmed.split_once(char::is_whitespace) {
                Some((_, host)) if !host.trim().is_empty() => {
                    let host = host.trim().to_string();
                    Ok(Self::Helo(if verb.eq_ignore_ascii_case("EHLO") {
                        HeloVariant::Ehlo(host)
                    } else {
                        HeloVariant::Helo(host)
                    }))
                }
                _ => Err(Self::Invalid(format!("Expected hostname in {trimmed}"))),
            }
        } else if verb.eq_ignore_ascii_case("MAIL") || verb.eq_ignore_ascii_case("RCPT") {
            Err(Self::Invalid(format!("Syntax error in {trimmed}")))
        } else if trimmed.eq_ignore_ascii_case("DATA") {
            Ok(Self::Data)
        } else if trimmed.eq_ignore_ascii_case("QUIT") {
            Ok(Self::Quit)
        } else if trimmed.eq_ignore_ascii_case("RSET") {
            Ok(Self::Rset)
        } else if verb.eq_ignore_ascii_case("NOOP") {
            Ok(Self::Noop)
        } else if verb.eq_ignore_ascii_case("HELP") {
            Ok(Self::Help)
        } else if verb.eq_ignore_ascii_case("VRFY") {
            Ok(Self::Vrfy)
        } else {
            Err(Self::Unknown(trimmed.to_owned()))
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Unknown("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
