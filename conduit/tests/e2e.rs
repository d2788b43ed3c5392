//! End-to-end tests: SMTP in, through the queue and workers, out through a
//! scripted email sender.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::{sync::Arc, time::Duration};

use conduit::{SupervisorError, notify::FAILURE_SUBJECT};
use conduit_delivery::{
    ErrorClass, Outcome,
    testing::{Scripted, ScriptedSender},
};
use pretty_assertions::assert_eq;
use support::{FROM_ADDRESS, PanicOnce, Relay, config};

const TEST_MESSAGE: &str =
    "From: user@lan\r\nTo: ops@yourdomain.com\r\nSubject: Test\r\n\r\nHello\r\n";

async fn submit(relay: &mut Relay, rcpt: &str) -> u32 {
    let mut client = relay.connect().await;
    assert_eq!(client.command("EHLO client.lan").await.0, 250);
    assert_eq!(client.command("MAIL FROM:<user@lan>").await.0, 250);
    assert_eq!(client.command(&format!("RCPT TO:<{rcpt}>")).await.0, 250);
    assert_eq!(client.command("DATA").await.0, 354);
    let (code, _) = client.data(TEST_MESSAGE).await;
    // A restarting relay may answer 421 here instead of 221
    client.command("QUIT").await;
    code
}

#[tokio::test]
async fn accepted_message_is_delivered_once() {
    let sender = Arc::new(ScriptedSender::default());
    let mut relay = Relay::start(config("", ""), sender.clone());

    assert_eq!(submit(&mut relay, "ops@yourdomain.com").await, 250);

    sender
        .wait_for_deliveries(1, Duration::from_secs(5))
        .await
        .expect("message delivered");

    let delivered = sender.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].sender(), FROM_ADDRESS);
    assert_eq!(delivered[0].reply_to(), "user@lan");
    assert_eq!(delivered[0].subject(), Some("Test"));
    assert_eq!(delivered[0].recipients(), ["ops@yourdomain.com"]);

    let body = String::from_utf8(delivered[0].body().to_vec()).unwrap();
    assert!(body.starts_with(&format!("From: {FROM_ADDRESS}\r\n")));
    assert!(body.contains("Reply-To: user@lan\r\n"));

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn sent_outcome_is_logged() {
    let sender = Arc::new(ScriptedSender::default());
    let mut relay = Relay::start(config("", ""), sender.clone());

    submit(&mut relay, "ops@yourdomain.com").await;
    sender
        .wait_for_deliveries(1, Duration::from_secs(5))
        .await
        .unwrap();

    let queue = relay.queue.clone();
    let log = relay.send_log.clone();
    relay.stop().await.unwrap();

    assert!(queue.is_empty());
    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, Outcome::Sent);
    assert_eq!(entries[0].from, "user@lan");
    assert_eq!(entries[0].to, ["ops@yourdomain.com"]);
    assert_eq!(entries[0].attempt, 1);
}

#[tokio::test]
async fn transient_failure_is_retried() {
    let sender = Arc::new(ScriptedSender::new([Scripted::Transient(
        "connection reset".to_string(),
    )]));
    let mut relay = Relay::start(config("message_retry_delay = 0", ""), sender.clone());

    submit(&mut relay, "ops@yourdomain.com").await;
    sender
        .wait_for_deliveries(1, Duration::from_secs(5))
        .await
        .unwrap();

    let log = relay.send_log.clone();
    relay.stop().await.unwrap();

    assert_eq!(sender.attempts(), 2);
    let outcomes: Vec<_> = log
        .entries()
        .iter()
        .map(|entry| (entry.outcome, entry.attempt))
        .collect();
    assert_eq!(outcomes, [(Outcome::Requeued, 1), (Outcome::Sent, 2)]);

    let requeued = &log.entries()[0];
    assert_eq!(
        requeued.error.as_ref().map(|error| error.class),
        Some(ErrorClass::Transient)
    );
}

#[tokio::test]
async fn exhausted_retries_fail_permanently() {
    let sender = Arc::new(ScriptedSender::new([Scripted::Permanent(
        "mailbox unavailable".to_string(),
    )]));
    let mut relay = Relay::start(config("message_retry = 0", ""), sender.clone());

    assert_eq!(submit(&mut relay, "ops@yourdomain.com").await, 250);

    let log = relay.send_log.clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("outcome logged");

    let queue = relay.queue.clone();
    relay.stop().await.unwrap();

    assert!(queue.is_empty());
    assert!(sender.delivered().is_empty());

    let entries = log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, Outcome::FailedPermanent);
    assert_eq!(
        entries[0].error.as_ref().map(|error| error.class),
        Some(ErrorClass::Permanent)
    );
}

#[tokio::test]
async fn disallowed_domain_never_reaches_the_queue() {
    let sender = Arc::new(ScriptedSender::default());
    let mut relay = Relay::start(config("", ""), sender.clone());

    let mut client = relay.connect().await;
    client.command("HELO client.lan").await;
    client.command("MAIL FROM:<user@lan>").await;
    assert_eq!(client.command("RCPT TO:<ops@elsewhere.com>").await.0, 550);
    assert_eq!(client.command("DATA").await.0, 554);
    client.command("QUIT").await;

    assert!(relay.queue.is_empty());
    relay.stop().await.unwrap();
    assert_eq!(sender.attempts(), 0);
}

#[tokio::test]
async fn crashed_worker_is_restarted_and_operator_notified() {
    let sender = Arc::new(PanicOnce::default());
    let mut relay = Relay::start(
        config("", r#"server_restart_email = "ops@yourdomain.com""#),
        sender.clone(),
    );

    assert_eq!(submit(&mut relay, "ops@yourdomain.com").await, 250);

    // The message that was in flight during the crash, then the report
    sender
        .inner
        .wait_for_deliveries(2, Duration::from_secs(5))
        .await
        .expect("both messages delivered after restart");

    let subjects: Vec<_> = sender
        .inner
        .delivered()
        .iter()
        .map(|envelope| envelope.subject().unwrap_or_default().to_string())
        .collect();
    assert!(subjects.contains(&"Test".to_string()));
    assert!(subjects.contains(&FAILURE_SUBJECT.to_string()));

    relay.stop().await.unwrap();
}

#[tokio::test]
async fn restart_budget_exhaustion_ends_the_relay() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = config("", "server_restart_per_hour = 1");
    config.listen = taken.local_addr().unwrap();

    let relay = Relay::start(config, Arc::new(ScriptedSender::default()));

    assert!(matches!(
        relay.finished().await,
        Err(SupervisorError::ExhaustedRestarts { budget: 1, .. })
    ));
}
