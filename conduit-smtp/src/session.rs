use std::{net::SocketAddr, sync::Arc, time::Duration};

use conduit_common::{
    Signal,
    clock::Clock,
    config::{RelayConfig, defaults},
    incoming, internal, outgoing,
};
use conduit_delivery::DeliveryQueue;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::broadcast,
};

use crate::{
    command::Command,
    error::SessionError,
    machine::{Action, Machine},
    response::Reply,
    state::State,
    transform::Transformer,
    verify::Verifier,
};

/// Longest command line accepted, terminator included
const MAX_COMMAND_LINE: usize = 4096;

/// Message data is read in pieces of at most this many bytes, so an
/// unterminated line cannot grow without bound
const DATA_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub struct SessionConfig {
    pub banner: String,
    pub max_message_size: usize,
    pub command_timeout: Duration,
    pub verifier: Verifier,
    pub transformer: Transformer,
}

impl SessionConfig {
    /// Create a new `SessionConfig` builder
    #[must_use]
    pub fn builder(verifier: Verifier, transformer: Transformer) -> SessionConfigBuilder {
        SessionConfigBuilder {
            banner: defaults::BANNER.to_string(),
            max_message_size: defaults::MAX_MESSAGE_SIZE,
            command_timeout: Duration::from_secs(defaults::COMMAND_TIMEOUT_SECS),
            verifier,
            transformer,
        }
    }

    /// Session settings for a validated relay configuration
    pub fn from_relay(config: &RelayConfig, clock: Arc<dyn Clock>) -> Self {
        Self::builder(
            Verifier::new(config.domains.iter().cloned(), config.subnets.iter().copied()),
            Transformer::new(config.from_address.as_str(), clock),
        )
        .with_banner(config.banner.clone())
        .with_max_message_size(config.smtp.max_message_size)
        .with_command_timeout(config.smtp.command_timeout)
        .build()
    }
}

/// Builder for `SessionConfig`
#[derive(Debug)]
pub struct SessionConfigBuilder {
    banner: String,
    max_message_size: usize,
    command_timeout: Duration,
    verifier: Verifier,
    transformer: Transformer,
}

impl SessionConfigBuilder {
    /// Set the hostname announced in the greeting
    #[must_use]
    pub fn with_banner(mut self, banner: String) -> Self {
        self.banner = banner;
        self
    }

    /// Set the largest message accepted, advertised via `SIZE`
    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set how long a client may stay silent before being disconnected
    #[must_use]
    pub const fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            banner: self.banner,
            max_message_size: self.max_message_size,
            command_timeout: self.command_timeout,
            verifier: self.verifier,
            transformer: self.transformer,
        }
    }
}

enum Read {
    Line(Vec<u8>),
    Eof,
    Shutdown,
    Timeout,
}

/// Read up to and including the next `\n`, or `limit` bytes, whichever comes
/// first.
async fn read_line<Stream: AsyncRead + Unpin>(
    stream: &mut BufReader<Stream>,
    limit: usize,
    timeout: Duration,
    signal: &mut broadcast::Receiver<Signal>,
) -> Result<Read, SessionError> {
    let read = async {
        let mut line = Vec::new();
        let len = (&mut *stream)
            .take(limit as u64)
            .read_until(b'\n', &mut line)
            .await?;
        Ok::<_, std::io::Error>((len, line))
    };

    tokio::select! {
        _ = signal.recv() => Ok(Read::Shutdown),
        result = tokio::time::timeout(timeout, read) => match result {
            Err(_) => Ok(Read::Timeout),
            Ok(Ok((0, _))) => Ok(Read::Eof),
            Ok(Ok((_, line))) => Ok(Read::Line(line)),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    stream: BufReader<Stream>,
    machine: Machine,
    queue: DeliveryQueue,
    command_timeout: Duration,
    max_message_size: usize,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        queue: DeliveryQueue,
    ) -> Self {
        Self {
            peer,
            stream: BufReader::new(stream),
            command_timeout: config.command_timeout,
            max_message_size: config.max_message_size,
            machine: Machine::new(peer.ip(), config),
            queue,
        }
    }

    /// Talk to the client until it quits, disconnects, times out or the relay
    /// shuts down.
    ///
    /// # Errors
    /// If the connection fails or the client times out
    pub async fn run(
        mut self,
        mut signal: broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        internal!(level = DEBUG, peer = %self.peer, "Connected");

        let result = self.serve(&mut signal).await;

        internal!(
            level = DEBUG,
            peer = %self.peer,
            state = %self.machine.state(),
            "Connection closed"
        );

        result
    }

    async fn serve(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let greeting = self.machine.greet();
        self.send(&greeting).await?;

        loop {
            let read = read_line(
                &mut self.stream,
                MAX_COMMAND_LINE,
                self.command_timeout,
                signal,
            )
            .await?;
            let line = match read {
                Read::Line(line) => line,
                interrupted => return self.interrupted(interrupted).await,
            };

            if line.len() >= MAX_COMMAND_LINE && !line.ends_with(b"\n") {
                let reply = self.machine.line_too_long();
                return self.send(&reply).await;
            }

            let command = Command::try_from(line.as_slice()).unwrap_or_else(|invalid| invalid);
            incoming!(peer = %self.peer, "{command}");

            match self.machine.command(command) {
                Action::Reply(reply) => self.send(&reply).await?,
                Action::Close(reply) => return self.send(&reply).await,
                Action::Enqueue(envelope) => {
                    let reply = self.enqueue(*envelope);
                    self.send(&reply).await?;
                }
            }

            if self.machine.state() == State::DataReceiving {
                self.receive_data(signal).await?;
                if self.machine.state().is_closed() {
                    return Ok(());
                }
            }
        }
    }

    /// Read message data up to the terminating `.` line, undoing dot-stuffing.
    ///
    /// Data past the size limit is read and thrown away so the client gets
    /// its reply only once it has finished sending.
    async fn receive_data(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let mut message = Vec::new();
        let mut oversized = false;
        let mut line_start = true;

        loop {
            let read =
                read_line(&mut self.stream, DATA_CHUNK, self.command_timeout, signal).await?;
            let chunk = match read {
                Read::Line(chunk) => chunk,
                interrupted => return self.interrupted(interrupted).await,
            };

            if line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }

            let data = if line_start && chunk.starts_with(b".") {
                &chunk[1..]
            } else {
                &chunk[..]
            };
            line_start = chunk.ends_with(b"\n");

            if oversized || message.len() + data.len() > self.max_message_size {
                oversized = true;
            } else {
                message.extend_from_slice(data);
            }
        }

        incoming!(peer = %self.peer, bytes = message.len(), oversized, "Message data received");

        let reply = match self.machine.data_complete(&message, oversized) {
            Action::Enqueue(envelope) => self.enqueue(*envelope),
            Action::Reply(reply) | Action::Close(reply) => reply,
        };

        self.send(&reply).await
    }

    fn enqueue(&mut self, envelope: conduit_common::envelope::Envelope) -> Reply {
        let result = self.queue.enqueue(envelope);
        self.machine.enqueued(result)
    }

    /// Wind down after a read that produced no data.
    async fn interrupted(&mut self, read: Read) -> Result<(), SessionError> {
        match read {
            Read::Line(_) | Read::Eof => {
                self.machine.shutdown();
                Ok(())
            }
            Read::Shutdown => {
                let reply = self.machine.shutdown();
                self.send(&reply).await
            }
            Read::Timeout => {
                internal!(
                    level = WARN,
                    peer = %self.peer,
                    state = %self.machine.state(),
                    timeout_secs = self.command_timeout.as_secs(),
                    "Client connection timed out"
                );
                let reply = self.machine.timeout();
                self.send(&reply).await?;
                Err(SessionError::Timeout(self.command_timeout))
            }
        }
    }

    async fn send(&mut self, reply: &Reply) -> Result<(), SessionError> {
        let rendered = reply.to_string();
        outgoing!(peer = %self.peer, "{}", rendered.trim_end());

        let stream = self.stream.get_mut();
        stream.write_all(rendered.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }
}
