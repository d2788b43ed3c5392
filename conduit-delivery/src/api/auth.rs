//! Request authentication for the email API.
//!
//! Two schemes are supported:
//! - a shared access key, used to HMAC-SHA256 sign every request
//! - a service principal, exchanged for an OAuth2 bearer token with the
//!   client-credentials grant

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use conduit_common::{clock, clock::Clock, internal};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::{Client, Method, RequestBuilder};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::{Position, Url};

use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const TOKEN_SCOPE: &str = "https://communication.azure.com/.default";

/// Tokens are refreshed this long before they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Headers carrying an HMAC request signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub date: String,
    pub content_hash: String,
    pub authorization: String,
}

/// Signs requests with a shared access key.
#[derive(Clone)]
pub struct HmacSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for HmacSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSigner").finish_non_exhaustive()
    }
}

impl HmacSigner {
    /// # Errors
    /// If `encoded` is not valid base64
    pub fn new(encoded: &str) -> Result<Self, ApiError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|err| ApiError::InvalidKey(err.to_string()))?;

        Ok(Self { key })
    }

    /// Sign `method url` carrying `body`, as of `now`.
    ///
    /// The string to sign is `METHOD\npath?query\ndate;host;content-hash`.
    ///
    /// # Errors
    /// If the key cannot be used as an HMAC key
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<SignedHeaders, ApiError> {
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_hash = STANDARD.encode(Sha256::digest(body));
        let host = &url[Position::BeforeHost..Position::AfterPort];
        let path_and_query = &url[Position::BeforePath..Position::AfterQuery];

        let to_sign = format!("{method}\n{path_and_query}\n{date};{host};{content_hash}");

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| ApiError::InvalidKey(err.to_string()))?;
        mac.update(to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(SignedHeaders {
            date,
            content_hash,
            authorization: format!(
                "HMAC-SHA256 SignedHeaders=x-ms-date;host;x-ms-content-sha256&Signature={signature}"
            ),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Obtains and caches bearer tokens for a service principal.
pub struct TokenProvider {
    http: Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// # Errors
    /// If `authority` and `tenant_id` do not form a valid URL
    pub fn new(
        http: Client,
        authority: &Url,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ApiError> {
        let token_url = Url::parse(&format!(
            "{}/{tenant_id}/oauth2/v2.0/token",
            authority.as_str().trim_end_matches('/')
        ))
        .map_err(|err| ApiError::Token(err.to_string()))?;

        Ok(Self {
            http,
            token_url,
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            clock,
            cached: Mutex::new(None),
        })
    }

    pub const fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// A token valid for at least the refresh margin, fetching one if needed.
    ///
    /// # Errors
    /// If the token endpoint cannot be reached or refuses the credentials
    pub async fn token(&self) -> Result<String, ApiError> {
        let now = self.clock.now();
        let cached = self.cached.lock().clone();
        if let Some(cached) = cached
            && clock::after(now, TOKEN_REFRESH_MARGIN) < cached.expires_at
        {
            return Ok(cached.token);
        }

        internal!(level = DEBUG, url = %self.token_url, "Requesting access token");

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Token(format!("{status}: {body}")));
        }

        let token: TokenResponse = response.json().await?;
        let cached = CachedToken {
            token: token.access_token,
            expires_at: clock::after(self.clock.now(), Duration::from_secs(token.expires_in)),
        };
        let access_token = cached.token.clone();
        *self.cached.lock() = Some(cached);

        Ok(access_token)
    }
}

/// How requests to the email API are authenticated
#[derive(Debug)]
pub enum Authenticator {
    Key(HmacSigner),
    Token(TokenProvider),
}

impl Authenticator {
    /// Add authentication headers to `request`, which sends `body` to `url`.
    ///
    /// # Errors
    /// If signing fails or no token can be obtained
    pub async fn authenticate(
        &self,
        request: RequestBuilder,
        method: &Method,
        url: &Url,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<RequestBuilder, ApiError> {
        match self {
            Self::Key(signer) => {
                let signed = signer.sign(method, url, body, now)?;
                Ok(request
                    .header("x-ms-date", signed.date)
                    .header("x-ms-content-sha256", signed.content_hash)
                    .header(reqwest::header::AUTHORIZATION, signed.authorization))
            }
            Self::Token(provider) => Ok(request.bearer_auth(provider.token().await?)),
        }
    }
}
