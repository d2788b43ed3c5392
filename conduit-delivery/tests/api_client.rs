#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;

use conduit_common::{
    clock::SystemClock,
    config::{ApiConfig, Credentials},
};
use conduit_delivery::{
    DeliveryError, EmailApiClient, EmailSender, PermanentError, TransientError,
};
use pretty_assertions::assert_eq;
use support::{MockApi, MockResponse, SHORT, envelope};
use url::Url;

fn key_config(base: &str) -> ApiConfig {
    ApiConfig {
        endpoint: Url::parse(base).unwrap(),
        api_version: "2023-03-31".to_string(),
        credentials: Credentials::Key("c2VjcmV0LWtleQ==".to_string()),
    }
}

fn accepted() -> MockResponse {
    MockResponse::json(202, r#"{"id":"op-1","status":"Running"}"#).with_header(
        "Operation-Location",
        "{base}/emails/operations/op-1?api-version=2023-03-31",
    )
}

#[tokio::test]
async fn key_client_posts_signed_request_and_polls_until_success() {
    let api = MockApi::start([
        accepted(),
        MockResponse::json(200, r#"{"id":"op-1","status":"Running"}"#),
        MockResponse::json(200, r#"{"id":"op-1","status":"Succeeded"}"#),
    ])
    .await;
    let client = EmailApiClient::new(&key_config(&api.base_url()), Arc::new(SystemClock))
        .unwrap()
        .with_poll_interval(SHORT);

    let receipt = client
        .send(&envelope(
            "ops@example.com",
            "Subject: Test\r\n\r\nHello\r\n",
            chrono::Utc::now(),
        ))
        .await
        .unwrap();

    assert_eq!(receipt.operation_id.as_deref(), Some("op-1"));

    let requests = api.requests();
    assert_eq!(requests.len(), 3);

    let post = &requests[0];
    assert_eq!(post.method, "POST");
    assert_eq!(post.target, "/emails:send?api-version=2023-03-31");
    assert!(post.header("x-ms-date").is_some());
    assert!(post.header("x-ms-content-sha256").is_some());
    assert!(
        post.header("authorization")
            .unwrap()
            .starts_with("HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature=")
    );

    let json = post.json();
    assert_eq!(json["senderAddress"], "relay@example.com");
    assert_eq!(json["replyTo"][0]["address"], "user@lan");
    assert_eq!(json["recipients"]["to"][0]["address"], "ops@example.com");
    assert_eq!(json["content"]["subject"], "Test");

    assert_eq!(requests[1].method, "GET");
    assert_eq!(
        requests[1].target,
        "/emails/operations/op-1?api-version=2023-03-31"
    );
}

#[tokio::test]
async fn failed_operation_is_permanent() {
    let api = MockApi::start([
        accepted(),
        MockResponse::json(
            200,
            r#"{"id":"op-1","status":"Failed","error":{"code":"Denied","message":"blocked"}}"#,
        ),
    ])
    .await;
    let client = EmailApiClient::new(&key_config(&api.base_url()), Arc::new(SystemClock))
        .unwrap()
        .with_poll_interval(SHORT);

    let err = client
        .send(&envelope("ops@example.com", "Subject: Test\r\n\r\nHi", chrono::Utc::now()))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DeliveryError::Permanent(PermanentError::OperationFailed { .. })
    ));
}

#[tokio::test]
async fn server_errors_are_transient_and_auth_errors_permanent() {
    let api = MockApi::start([
        MockResponse::json(503, r#"{"error":"busy"}"#),
        MockResponse::json(401, r#"{"error":"denied"}"#),
    ])
    .await;
    let client = EmailApiClient::new(&key_config(&api.base_url()), Arc::new(SystemClock)).unwrap();
    let message = envelope("ops@example.com", "Subject: Test\r\n\r\nHi", chrono::Utc::now());

    let err = client.send(&message).await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::Transient(TransientError::Server { status: 503, .. })
    ));

    let err = client.send(&message).await.unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::Permanent(PermanentError::Authentication(_))
    ));
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    // Bind and immediately drop to find a port nobody listens on.
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = EmailApiClient::new(
        &key_config(&format!("http://127.0.0.1:{port}")),
        Arc::new(SystemClock),
    )
    .unwrap();

    let err = client
        .send(&envelope("ops@example.com", "Subject: Test\r\n\r\nHi", chrono::Utc::now()))
        .await
        .unwrap_err();

    assert!(err.is_transient());
}

#[tokio::test]
async fn service_principal_token_is_fetched_once_and_reused() {
    let api = MockApi::start([
        MockResponse::json(
            200,
            r#"{"access_token":"token-1","expires_in":3600,"token_type":"Bearer"}"#,
        ),
        MockResponse::json(200, r#"{"id":"op-1","status":"Succeeded"}"#),
        MockResponse::json(200, r#"{"id":"op-2","status":"Succeeded"}"#),
    ])
    .await;
    let config = ApiConfig {
        credentials: Credentials::ClientSecret {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        },
        ..key_config(&api.base_url())
    };
    let client = EmailApiClient::with_authority(
        &config,
        &Url::parse(&api.base_url()).unwrap(),
        Arc::new(SystemClock),
    )
    .unwrap();
    let message = envelope("ops@example.com", "Subject: Test\r\n\r\nHi", chrono::Utc::now());

    client.send(&message).await.unwrap();
    client.send(&message).await.unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 3);

    let token = &requests[0];
    assert_eq!(token.target, "/tenant/oauth2/v2.0/token");
    let form = String::from_utf8(token.body.clone()).unwrap();
    assert!(form.contains("grant_type=client_credentials"));
    assert!(form.contains("client_id=client"));
    assert!(form.contains("scope=https%3A%2F%2Fcommunication.azure.com%2F.default"));

    for send in &requests[1..] {
        assert_eq!(send.header("authorization"), Some("Bearer token-1"));
    }
}
