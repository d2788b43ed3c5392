use core::fmt::{self, Display, Formatter};

use crate::command::{Command, HeloVariant};

/// Where a session is in the SMTP dialogue.
///
/// The states only describe sequencing; the data a transaction accumulates
/// lives in [`Transaction`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum State {
    #[default]
    Connected,
    GreetingSent,
    Greeted,
    SenderSet,
    RecipientAccumulating,
    DataReceiving,
    /// The last message was accepted; behaves as [`State::Greeted`]
    Queued,
    /// The last message was refused; behaves as [`State::Greeted`]
    Rejected,
    Closed,
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.write_str(match self {
            Self::Connected => "Connected",
            Self::GreetingSent => "GreetingSent",
            Self::Greeted => "Greeted",
            Self::SenderSet => "SenderSet",
            Self::RecipientAccumulating => "RecipientAccumulating",
            Self::DataReceiving => "DataReceiving",
            Self::Queued => "Queued",
            Self::Rejected => "Rejected",
            Self::Closed => "Closed",
        })
    }
}

/// What the client has told us so far in this session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub helo: Option<HeloVariant>,
    /// Empty for a null reverse-path
    pub sender: String,
    pub recipients: Vec<String>,
}

impl Transaction {
    /// Forget the current mail transaction, keeping the greeting.
    pub fn reset(&mut self) {
        self.sender.clear();
        self.recipients.clear();
    }
}

/// A command arrived in a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfSequence(pub &'static str);

impl State {
    /// Whether a new mail transaction may start here
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Greeted | Self::Queued | Self::Rejected)
    }

    pub const fn accepts_recipients(self) -> bool {
        matches!(self, Self::SenderSet | Self::RecipientAccumulating)
    }

    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Advance on `command`, recording what it carries in `txn`.
    ///
    /// Commands that never change the dialogue (`NOOP`, `HELP`, `VRFY` and
    /// unparseable input) leave the state as it is.
    ///
    /// # Errors
    /// If `command` is not allowed in this state. Neither the state nor `txn`
    /// are changed in that case.
    pub fn transition(self, command: Command, txn: &mut Transaction) -> Result<Self, OutOfSequence> {
        match (self, command) {
            (Self::Connected, _) => Err(OutOfSequence("Greeting not sent")),
            (Self::Closed, _) => Err(OutOfSequence("Connection closed")),
            (Self::DataReceiving, _) => Err(OutOfSequence("Message data in progress")),

            (_, Command::Quit) => Ok(Self::Closed),

            (_, Command::Helo(helo)) => {
                txn.reset();
                txn.helo = Some(helo);
                Ok(Self::Greeted)
            }

            (_, Command::Rset) => {
                txn.reset();
                Ok(if txn.helo.is_some() {
                    Self::Greeted
                } else {
                    Self::GreetingSent
                })
            }

            (state, Command::MailFrom(sender)) if state.is_ready() => {
                txn.sender = sender.unwrap_or_default();
                txn.recipients.clear();
                Ok(Self::SenderSet)
            }
            (Self::GreetingSent, Command::MailFrom(_)) => Err(OutOfSequence("Send HELO/EHLO first")),
            (_, Command::MailFrom(_)) => Err(OutOfSequence("Sender already specified")),

            (state, Command::RcptTo(rcpt)) if state.accepts_recipients() => {
                txn.recipients.push(rcpt);
                Ok(Self::RecipientAccumulating)
            }
            (_, Command::RcptTo(_)) => Err(OutOfSequence("Need MAIL before RCPT")),

            (Self::RecipientAccumulating, Command::Data) => Ok(Self::DataReceiving),
            (Self::SenderSet, Command::Data) => Err(OutOfSequence("Need RCPT before DATA")),
            (_, Command::Data) => Err(OutOfSequence("Need MAIL before DATA")),

            (
                state,
                Command::Noop | Command::Help | Command::Vrfy | Command::Invalid(_) | Command::Unknown(_),
            ) => Ok(state),
        }
    }
}
