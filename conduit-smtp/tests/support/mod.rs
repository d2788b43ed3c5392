//! Test support for the SMTP crate's integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use conduit_common::{
    Signal,
    clock::{Clock, ManualClock},
};
use conduit_delivery::DeliveryQueue;
use conduit_smtp::{ListenerError, SessionConfig, SmtpListener, Transformer, Verifier};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::broadcast,
    task::JoinHandle,
};

pub const FROM_ADDRESS: &str = "relay@example.com";

/// A listener on an ephemeral loopback port, feeding its own queue
pub struct Relay {
    pub address: SocketAddr,
    pub queue: DeliveryQueue,
    pub clock: ManualClock,
    shutdown: broadcast::Sender<Signal>,
    handle: JoinHandle<Result<(), ListenerError>>,
}

impl Relay {
    pub async fn start(subnets: &[&str], capacity: usize) -> Self {
        Self::start_with(subnets, capacity, Duration::from_secs(30)).await
    }

    pub async fn start_with(subnets: &[&str], capacity: usize, timeout: Duration) -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());

        let config = SessionConfig::builder(
            Verifier::new(
                ["example.com".to_string(), ".corp.example.net".to_string()],
                subnets.iter().map(|subnet| subnet.parse().unwrap()),
            ),
            Transformer::new(FROM_ADDRESS, Arc::clone(&shared)),
        )
        .with_banner("relay.test".to_string())
        .with_max_message_size(4096)
        .with_command_timeout(timeout)
        .build();

        let queue = DeliveryQueue::new(capacity, shared);
        let listener = SmtpListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(config),
            queue.clone(),
        )
        .await
        .unwrap();
        let address = listener.local_addr().unwrap();

        let (shutdown, receiver) = broadcast::channel(1);
        let handle = tokio::spawn(listener.serve(receiver));

        Self {
            address,
            queue,
            clock,
            shutdown,
            handle,
        }
    }

    pub async fn connect(&self) -> SmtpClient {
        SmtpClient::connect(self.address).await
    }

    pub async fn stop(self) -> Result<(), ListenerError> {
        self.shutdown.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("listener stops")
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

    /// Read one reply, joining continuation lines. Returns `(0, "")` on EOF.
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

    /// Send message data, dot-stuffed, followed by the terminating `.` line
    pub async fn data(&mut self, message: &str) -> (u32, String) {
        let mut stuffed = String::new();
        for line in message.split_inclusive('\n') {
            if line.starts_with('.') {
                stuffed.push('.');
            }
            stuffed.push_str(line);
        }
        if !stuffed.ends_with('\n') {
            stuffed.push_str("\r\n");
        }
        stuffed.push_str(".\r\n");

        self.writer.write_all(stuffed.as_bytes()).await.unwrap();
        self.reply().await
    }

    /// Run a whole transaction; returns the reply to the end of data
    pub async fn send_mail(&mut self, from: &str, to: &[&str], message: &str) -> (u32, String) {
        assert_eq!(self.command(&format!("MAIL FROM:<{from}>")).await.0, 250);
        for rcpt in to {
            assert_eq!(self.command(&format!("RCPT TO:<{rcpt}>")).await.0, 250);
        }
        assert_eq!(self.command("DATA").await.0, 354);
        self.data(message).await
    }
}
