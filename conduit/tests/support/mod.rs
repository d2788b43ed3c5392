//! Test harness running a whole relay on a loopback port.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use conduit::{Supervisor, SupervisorError};
use conduit_common::{
    clock::ManualClock,
    config::{RawConfig, RelayConfig},
    envelope::Envelope,
};
use conduit_delivery::{
    DeliveryError, DeliveryQueue, EmailSender, SendLog, SendReceipt, testing::ScriptedSender,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{oneshot, watch},
    task::JoinHandle,
};

pub const FROM_ADDRESS: &str = "relay@yourdomain.com";

/// Relay configuration on an ephemeral loopback port. `relay` is appended to
/// the `[relay]` table and `server` to the `[server]` table.
pub fn config(relay: &str, server: &str) -> RelayConfig {
    let document = format!(
        r#"
        [relay]
        address = "127.0.0.1"
        port = 0
        from_address = "{FROM_ADDRESS}"
        domains = "yourdomain.com"
        subnets = "127.0.0.0/8"
        {relay}

        [server]
        {server}

        [azure]
        endpoint = "https://example.communication.azure.com"
        key = "c2VjcmV0"
        "#
    );

    let mut config = RawConfig::from_toml(&document).unwrap().validate().unwrap();
    config.supervisor.restart_delay = Duration::ZERO;
    config
}

pub struct Relay {
    pub queue: DeliveryQueue,
    pub send_log: SendLog,
    pub clock: ManualClock,
    listening: watch::Receiver<Option<SocketAddr>>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), SupervisorError>>,
}

impl Relay {
    pub fn start(config: RelayConfig, sender: Arc<dyn EmailSender>) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let supervisor = Supervisor::new(config, sender, Arc::new(clock.clone()));

        let queue = supervisor.queue().clone();
        let send_log = supervisor.send_log().clone();
        let listening = supervisor.listening();
        let (stop, stopped) = oneshot::channel();

        let handle = tokio::spawn(supervisor.run(async move {
            stopped.await.ok();
        }));

        Self {
            queue,
            send_log,
            clock,
            listening,
            stop,
            handle,
        }
    }

    pub async fn address(&mut self) -> SocketAddr {
        let address = tokio::time::timeout(
            Duration::from_secs(5),
            self.listening.wait_for(Option::is_some),
        )
        .await
        .expect("relay starts listening")
        .unwrap();

        address.expect("address is set")
    }

    pub async fn connect(&mut self) -> SmtpClient {
        let address = self.address().await;
        let mut client = SmtpClient::connect(address).await;
        assert_eq!(client.reply().await.0, 220);
        client
    }

    pub async fn stop(self) -> Result<(), SupervisorError> {
        self.stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("relay stops")
            .unwrap()
    }

    pub async fn finished(self) -> Result<(), SupervisorError> {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("relay finishes")
            .unwrap()
    }
}

pub struct SmtpClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl SmtpClient {
    pub async fn connect(address: SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(address).await.unwrap().into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    pub async fn reply(&mut self) -> (u32, String) {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await.unwrap() == 0 {
                return (0, text);
            }
            text.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return (line[..3].parse().unwrap(), text);
            }
        }
    }

    pub async fn command(&mut self, line: &str) -> (u32, String) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }

    /// Send already dot-stuffed message data and the terminating `.` line
    pub async fn data(&mut self, message: &str) -> (u32, String) {
        self.writer
            .write_all(format!("{message}.\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }
}

/// Panics on its first send, then behaves like the wrapped sender
#[derive(Debug, Default)]
pub struct PanicOnce {
    panicked: AtomicBool,
    pub inner: ScriptedSender,
}

#[async_trait]
impl EmailSender for PanicOnce {
    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, DeliveryError> {
        assert!(
            self.panicked.swap(true, Ordering::SeqCst),
            "sender blew up"
        );
        self.inner.send(envelope).await
    }
}
