//! HTTPS client for the cloud email API.
//!
//! A send is a `POST {endpoint}/emails:send?api-version=...` followed by
//! polling the operation URL returned in the `operation-location` header until
//! the operation reaches a terminal status. The whole exchange is bounded by
//! the worker's send timeout.

pub mod auth;
pub mod payload;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use conduit_common::{
    clock::Clock,
    config::{ApiConfig, Credentials},
    envelope::Envelope,
    internal,
};
use reqwest::{Client, Method, Response, header::HeaderMap};
use serde::Deserialize;
use url::Url;

pub use self::{
    auth::{Authenticator, HmacSigner, TokenProvider},
    payload::EmailMessage,
};
use crate::{
    error::{ApiError, DeliveryError},
    sender::{EmailSender, SendReceipt},
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct OperationError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    #[serde(default)]
    id: Option<String>,
    status: String,
    #[serde(default)]
    error: Option<OperationError>,
}

impl OperationStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self.status.to_ascii_lowercase().as_str(),
            "succeeded" | "failed" | "canceled" | "cancelled"
        )
    }

    fn into_result(self, fallback_id: Option<String>) -> Result<SendReceipt, ApiError> {
        if self.status.eq_ignore_ascii_case("succeeded") {
            return Ok(SendReceipt {
                operation_id: self.id.or(fallback_id),
            });
        }

        let message = self
            .error
            .map(|error| match (error.code, error.message) {
                (Some(code), Some(message)) => format!("{code}: {message}"),
                (code, message) => message.or(code).unwrap_or_default(),
            })
            .unwrap_or_default();

        Err(ApiError::Operation {
            status: self.status,
            message,
        })
    }
}

/// Client for the email API, authenticated with either an access key or a
/// service principal.
#[derive(Debug, Clone)]
pub struct EmailApiClient {
    http: Client,
    endpoint: Url,
    api_version: String,
    auth: Arc<Authenticator>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl EmailApiClient {
    /// Build a client from the validated API configuration.
    ///
    /// # Errors
    /// If the HTTP client cannot be built or the credentials are unusable
    pub fn new(config: &ApiConfig, clock: Arc<dyn Clock>) -> Result<Self, ApiError> {
        let authority = Url::parse(auth::DEFAULT_AUTHORITY)
            .map_err(|err| ApiError::Token(err.to_string()))?;
        Self::with_authority(config, &authority, clock)
    }

    /// As [`EmailApiClient::new`], requesting tokens from `authority` instead
    /// of the public identity platform.
    ///
    /// # Errors
    /// If the HTTP client cannot be built or the credentials are unusable
    pub fn with_authority(
        config: &ApiConfig,
        authority: &Url,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("conduit/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let auth = match &config.credentials {
            Credentials::Key(key) => Authenticator::Key(HmacSigner::new(key)?),
            Credentials::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => Authenticator::Token(TokenProvider::new(
                http.clone(),
                authority,
                tenant_id,
                client_id,
                client_secret,
                Arc::clone(&clock),
            )?),
        };

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_version: config.api_version.clone(),
            auth: Arc::new(auth),
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Fallback delay between status polls when the API gives no `retry-after`
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// The URL messages are posted to
    pub fn send_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        let path = format!("{}/emails:send", url.path().trim_end_matches('/'));
        url.set_path(&path);
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        url
    }

    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
    ) -> Result<Response, ApiError> {
        let mut request = self.http.request(method.clone(), url.clone());
        if method == Method::POST {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let request = self
            .auth
            .authenticate(request, &method, &url, &body, self.clock.now())
            .await?;

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Submit `message` and wait for the send operation to finish.
    ///
    /// # Errors
    /// If the request is refused or the operation ends in a failed state
    pub async fn submit(&self, message: &EmailMessage) -> Result<SendReceipt, ApiError> {
        let body = serde_json::to_vec(message).map_err(|err| ApiError::Payload(err.to_string()))?;
        let response = self.request(Method::POST, self.send_url(), body).await?;

        let location = operation_location(response.headers());
        let mut delay = retry_after(response.headers()).unwrap_or(self.poll_interval);
        let initial = response.json::<OperationStatus>().await.ok();
        let operation_id = initial.as_ref().and_then(|op| op.id.clone());

        if let Some(initial) = initial
            && initial.is_terminal()
        {
            return initial.into_result(operation_id);
        }

        let Some(location) = location else {
            // Accepted without anything to poll
            return Ok(SendReceipt { operation_id });
        };

        loop {
            tokio::time::sleep(delay).await;

            let response = self
                .request(Method::GET, location.clone(), Vec::new())
                .await?;
            delay = retry_after(response.headers()).unwrap_or(self.poll_interval);
            let status = response.json::<OperationStatus>().await?;

            internal!(
                level = TRACE,
                operation = status.id.as_deref().unwrap_or_default(),
                status = %status.status,
                "Polled send operation"
            );

            if status.is_terminal() {
                return status.into_result(operation_id);
            }
        }
    }
}

fn operation_location(headers: &HeaderMap) -> Option<Url> {
    headers
        .get("operation-location")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Url::parse(value).ok())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl EmailSender for EmailApiClient {
    async fn send(&self, envelope: &Envelope) -> Result<SendReceipt, DeliveryError> {
        let message = EmailMessage::from_envelope(envelope)?;
        Ok(self.submit(&message).await?)
    }
}
