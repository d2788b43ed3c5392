use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use conduit_common::{Signal, internal};
use conduit_delivery::DeliveryQueue;
use futures_util::future::join_all;
use tokio::{
    net::TcpListener,
    sync::broadcast::{self, error::RecvError},
};

use crate::{
    error::{ListenerError, SessionError},
    session::{Session, SessionConfig},
};

/// Pause before accepting again when the process is short of descriptors
/// or memory, so the loop does not spin on the same error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What a failed `accept` says about the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Only the connection being accepted is affected
    Connection,
    /// Out of descriptors, buffers or memory; may clear once sessions close
    Resources,
    /// The listening socket itself is unusable
    Fatal,
}

impl AcceptFailure {
    fn of(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => Self::Resources,
            Some(libc::EBADF | libc::EINVAL | libc::ENOTSOCK | libc::EOPNOTSUPP) => Self::Fatal,
            _ => Self::Connection,
        }
    }
}

/// Accepts SMTP clients and runs a [`Session`] for each of them.
#[derive(Debug)]
pub struct SmtpListener {
    listener: TcpListener,
    config: Arc<SessionConfig>,
    queue: DeliveryQueue,
}

impl SmtpListener {
    /// # Errors
    /// If `address` cannot be bound
    pub async fn bind(
        address: SocketAddr,
        config: Arc<SessionConfig>,
        queue: DeliveryQueue,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ListenerError::Bind { address, source })?;

        Ok(Self {
            listener,
            config,
            queue,
        })
    }

    /// # Errors
    /// If the socket has no local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signalled, then wait for the open
    /// sessions to finish.
    ///
    /// Failing to accept a single connection is logged and the loop carries
    /// on, backing off briefly when resources run out.
    ///
    /// # Errors
    /// If the listening socket becomes unusable. Sessions already running are
    /// left to finish on their own.
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ListenerError> {
        let local = self.local_addr().map_err(ListenerError::Accept)?;
        internal!(level = INFO, address = %local, "SMTP listener ready");

        let mut sessions = Vec::default();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        internal!(
                            level = INFO,
                            address = %local,
                            sessions = sessions.len(),
                            "SMTP listener received shutdown signal, finishing sessions ..."
                        );
                        join_all(sessions).await;
                        break;
                    }
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(accepted) => accepted,
                        Err(err) => match AcceptFailure::of(&err) {
                            AcceptFailure::Fatal => return Err(ListenerError::Accept(err)),
                            failure => {
                                internal!(level = WARN, address = %local, ?failure, "Failed to accept connection: {err}");
                                if failure == AcceptFailure::Resources {
                                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                                }
                                continue;
                            }
                        },
                    };
                    internal!(level = DEBUG, %peer, "Connection received");

                    sessions.retain(|session: &tokio::task::JoinHandle<()>| !session.is_finished());

                    let session = Session::new(stream, peer, Arc::clone(&self.config), self.queue.clone());
                    let signal = shutdown.resubscribe();
                    sessions.push(tokio::spawn(async move {
                        match session.run(signal).await {
                            Ok(()) => {}
                            Err(SessionError::Timeout(_)) => {
                                internal!(level = DEBUG, %peer, "Session timed out");
                            }
                            Err(err) => internal!(level = WARN, %peer, "Session failed: {err}"),
                        }
                    }));
                }
            }
        }

        Ok(())
    }
}
