//! Protocol logic for one client, independent of the socket.
//!
//! The session feeds parsed commands and message data in, and performs
//! whatever [`Action`] comes back. Nothing here does I/O, so the whole
//! dialogue can be driven from tests.

use std::{net::IpAddr, sync::Arc};

use conduit_common::{envelope::{Envelope, EnvelopeId}, internal, status::Status};
use conduit_delivery::QueueError;

use crate::{
    command::Command,
    response::Reply,
    session::SessionConfig,
    state::{OutOfSequence, State, Transaction},
};

/// What the session must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send the reply and keep reading
    Reply(Reply),
    /// Send the reply and close the connection
    Close(Reply),
    /// Queue the envelope, then report the result through
    /// [`Machine::enqueued`]
    Enqueue(Box<Envelope>),
}

#[derive(Debug)]
pub struct Machine {
    state: State,
    txn: Transaction,
    peer: IpAddr,
    config: Arc<SessionConfig>,
}

impl Machine {
    pub fn new(peer: IpAddr, config: Arc<SessionConfig>) -> Self {
        Self {
            state: State::default(),
            txn: Transaction::default(),
            peer,
            config,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    pub const fn transaction(&self) -> &Transaction {
        &self.txn
    }

    pub fn greet(&mut self) -> Reply {
        self.state = State::GreetingSent;
        Reply::new(
            Status::ServiceReady,
            format!("{} ESMTP conduit ready", self.config.banner),
        )
    }

    /// Handle one command line.
    pub fn command(&mut self, command: Command) -> Action {
        match &command {
            Command::Unknown(_) => {
                return Action::Reply(Reply::new(Status::SyntaxError, "Command not recognised"));
            }
            Command::Invalid(reason) => {
                return Action::Reply(Reply::new(Status::ParameterSyntaxError, reason.clone()));
            }
            Command::RcptTo(rcpt) if self.state.accepts_recipients() => {
                if let Err(err) = self.config.verifier.verify(self.peer, rcpt) {
                    internal!(
                        level = INFO,
                        peer = %self.peer,
                        recipient = %rcpt,
                        "Refusing recipient: {err}"
                    );
                    let reply = Reply::new(Status::Error, err.to_string());
                    if err.closes_session() {
                        self.state = State::Closed;
                        return Action::Close(reply);
                    }
                    return Action::Reply(reply);
                }
            }
            Command::Data if self.state == State::SenderSet => {
                return Action::Reply(Reply::new(Status::TransactionFailed, "No valid recipients"));
            }
            _ => {}
        }

        match self.state.transition(command.clone(), &mut self.txn) {
            Ok(next) => {
                self.state = next;
                self.reply_to(&command)
            }
            Err(OutOfSequence(reason)) => {
                Action::Reply(Reply::new(Status::InvalidCommandSequence, reason))
            }
        }
    }

    fn reply_to(&self, command: &Command) -> Action {
        let banner = &self.config.banner;
        Action::Reply(match command {
            Command::Helo(helo) if helo.is_extended() => Reply::multiline(
                Status::Ok,
                [
                    format!("{banner} greets {}", helo.id()),
                    "8BITMIME".to_string(),
                    format!("SIZE {}", self.config.max_message_size),
                ],
            ),
            Command::Helo(helo) => Reply::new(Status::Ok, format!("{banner} greets {}", helo.id())),
            Command::Data => Reply::new(Status::StartMailInput, "End data with <CR><LF>.<CR><LF>"),
            Command::Help => Reply::multiline(
                Status::HelpMessage,
                [
                    "Supported commands:",
                    "EHLO HELO MAIL RCPT DATA RSET NOOP HELP VRFY QUIT",
                ],
            ),
            Command::Vrfy => Reply::new(
                Status::CannotVerify,
                "Cannot VRFY user, but will accept message and attempt delivery",
            ),
            Command::Quit => {
                return Action::Close(Reply::new(Status::GoodBye, "Bye"));
            }
            Command::MailFrom(_)
            | Command::RcptTo(_)
            | Command::Rset
            | Command::Noop
            | Command::Invalid(_)
            | Command::Unknown(_) => Reply::new(Status::Ok, "Ok"),
        })
    }

    /// The client finished sending message data.
    ///
    /// `oversized` is set when the data went over the size limit; whatever
    /// was read is then discarded and the message refused.
    pub fn data_complete(&mut self, message: &[u8], oversized: bool) -> Action {
        if self.state != State::DataReceiving {
            return Action::Reply(Reply::new(Status::InvalidCommandSequence, "No message in progress"));
        }

        if oversized {
            internal!(
                level = INFO,
                peer = %self.peer,
                limit = self.config.max_message_size,
                "Refusing oversized message"
            );
            self.reject();
            return Action::Reply(Reply::new(
                Status::ExceededStorage,
                "Message exceeds fixed maximum message size",
            ));
        }

        match self
            .config
            .transformer
            .transform(message, &self.txn.sender, &self.txn.recipients)
        {
            Ok(envelope) => Action::Enqueue(Box::new(envelope)),
            Err(err) => {
                internal!(level = INFO, peer = %self.peer, error = %err, "Refusing message");
                self.reject();
                Action::Reply(Reply::new(
                    Status::TransactionFailed,
                    format!("Transaction failed: {err}"),
                ))
            }
        }
    }

    /// Report the outcome of queueing the envelope from [`Action::Enqueue`].
    pub fn enqueued(&mut self, result: Result<EnvelopeId, QueueError>) -> Reply {
        match result {
            Ok(id) => {
                internal!(
                    level = INFO,
                    envelope = %id,
                    peer = %self.peer,
                    from = %self.txn.sender,
                    to = ?self.txn.recipients,
                    "Message queued"
                );
                self.txn.reset();
                self.state = State::Queued;
                Reply::new(Status::Ok, format!("Ok: queued as {id}"))
            }
            Err(err) => {
                internal!(level = WARN, peer = %self.peer, error = %err, "Unable to queue message");
                self.reject();
                if err.is_temporary() {
                    Reply::new(Status::InsufficientStorage, format!("{err}, try again later"))
                } else {
                    Reply::new(Status::TransactionFailed, format!("Transaction failed: {err}"))
                }
            }
        }
    }

    /// The client went quiet for longer than the command timeout.
    pub fn timeout(&mut self) -> Reply {
        self.state = State::Closed;
        Reply::new(
            Status::Unavailable,
            format!("{} Timeout, closing connection", self.config.banner),
        )
    }

    /// The relay is stopping.
    pub fn shutdown(&mut self) -> Reply {
        self.state = State::Closed;
        Reply::new(Status::Unavailable, "Server shutting down")
    }

    /// A command line went over the line length limit.
    pub fn line_too_long(&mut self) -> Reply {
        self.state = State::Closed;
        Reply::new(Status::SyntaxError, "Line too long")
    }

    fn reject(&mut self) {
        self.txn.reset();
        self.state = State::Rejected;
    }
}
