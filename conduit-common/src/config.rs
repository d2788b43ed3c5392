//! Relay configuration.
//!
//! Configuration arrives in two layers that share one shape, [`RawConfig`]:
//! the TOML file and the command-line overrides. The layers are merged with
//! [`RawConfig::merge`] (overrides win) and then turned into the immutable
//! [`RelayConfig`] by [`RawConfig::validate`], which applies defaults and
//! rejects anything unusable before a socket is opened.

use std::{
    fmt::{self, Debug, Formatter},
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use ipnet::IpNet;
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{error::ConfigError, logging};

pub mod defaults {
    pub const ADDRESS: &str = "0.0.0.0";
    pub const PORT: u16 = 10025;
    pub const BANNER: &str = "localhost";
    pub const MAX_QUEUE_LENGTH: usize = 100;
    pub const ENABLE_SEND_LOG: bool = true;
    pub const RETAIN_LOG_DAYS: u64 = 72;
    pub const SEND_QUEUE_MAX_AGE_SECS: u64 = 43_200;
    pub const SEND_TIMEOUT_SECS: u64 = 30;
    pub const MESSAGE_RETRY: u32 = 3;
    pub const MESSAGE_RETRY_DELAY_SECS: u64 = 3_600;
    pub const WORKERS: usize = 1;
    pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
    pub const COMMAND_TIMEOUT_SECS: u64 = 300;
    pub const RESTART_PER_HOUR: usize = 5;
    pub const RESTART_DELAY_SECS: u64 = 5;
    pub const API_VERSION: &str = "2023-03-31";
}

/// A list value that may be written either as a TOML array or as a single
/// string of comma or newline separated items.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum StringList {
    One(String),
    Many(Vec<String>),
}

impl StringList {
    /// Flatten into trimmed, non-empty items
    pub fn items(&self) -> Vec<String> {
        let split = |value: &str| -> Vec<String> {
            value
                .split([',', '\n'])
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToOwned::to_owned)
                .collect()
        };

        match self {
            Self::One(value) => split(value),
            Self::Many(values) => values.iter().flat_map(|value| split(value)).collect(),
        }
    }
}

impl From<&str> for StringList {
    fn from(value: &str) -> Self {
        Self::One(value.to_owned())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawRelay {
    pub address: Option<String>,
    pub port: Option<u16>,
    pub banner: Option<String>,
    pub from_address: Option<String>,
    pub domains: Option<StringList>,
    pub subnets: Option<StringList>,
    pub log_level: Option<String>,
    pub max_queue_length: Option<usize>,
    pub enable_send_log: Option<bool>,
    pub retain_log_days: Option<u64>,
    pub send_queue_max_age: Option<u64>,
    pub send_timeout: Option<u64>,
    pub message_retry: Option<u32>,
    pub message_retry_delay: Option<u64>,
    pub workers: Option<usize>,
    pub max_message_size: Option<usize>,
    pub command_timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawServer {
    pub server_restart_per_hour: Option<usize>,
    pub server_restart_email: Option<String>,
    pub server_restart_delay: Option<u64>,
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawAzure {
    pub endpoint: Option<String>,
    pub api_version: Option<String>,
    pub key: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl Debug for RawAzure {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RawAzure")
            .field("endpoint", &self.endpoint)
            .field("api_version", &self.api_version)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One layer of configuration, as read from a file or the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub relay: RawRelay,
    pub server: RawServer,
    pub azure: RawAzure,
}

fn overlay<T>(base: &mut Option<T>, over: Option<T>) {
    if over.is_some() {
        *base = over;
    }
}

impl RawConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    /// If the document is not valid TOML or a value has the wrong type
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// If the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml(&document)
    }

    /// Lay `overrides` on top of `self`; every value set in `overrides` wins.
    #[must_use]
    pub fn merge(mut self, overrides: Self) -> Self {
        let (relay, server, azure) = (overrides.relay, overrides.server, overrides.azure);

        overlay(&mut self.relay.address, relay.address);
        overlay(&mut self.relay.port, relay.port);
        overlay(&mut self.relay.banner, relay.banner);
        overlay(&mut self.relay.from_address, relay.from_address);
        overlay(&mut self.relay.domains, relay.domains);
        overlay(&mut self.relay.subnets, relay.subnets);
        overlay(&mut self.relay.log_level, relay.log_level);
        overlay(&mut self.relay.max_queue_length, relay.max_queue_length);
        overlay(&mut self.relay.enable_send_log, relay.enable_send_log);
        overlay(&mut self.relay.retain_log_days, relay.retain_log_days);
        overlay(&mut self.relay.send_queue_max_age, relay.send_queue_max_age);
        overlay(&mut self.relay.send_timeout, relay.send_timeout);
        overlay(&mut self.relay.message_retry, relay.message_retry);
        overlay(&mut self.relay.message_retry_delay, relay.message_retry_delay);
        overlay(&mut self.relay.workers, relay.workers);
        overlay(&mut self.relay.max_message_size, relay.max_message_size);
        overlay(&mut self.relay.command_timeout, relay.command_timeout);

        overlay(
            &mut self.server.server_restart_per_hour,
            server.server_restart_per_hour,
        );
        overlay(
            &mut self.server.server_restart_email,
            server.server_restart_email,
        );
        overlay(
            &mut self.server.server_restart_delay,
            server.server_restart_delay,
        );

        overlay(&mut self.azure.endpoint, azure.endpoint);
        overlay(&mut self.azure.api_version, azure.api_version);
        overlay(&mut self.azure.key, azure.key);
        overlay(&mut self.azure.tenant_id, azure.tenant_id);
        overlay(&mut self.azure.client_id, azure.client_id);
        overlay(&mut self.azure.client_secret, azure.client_secret);

        self
    }

    /// Apply defaults and check every value.
    ///
    /// # Errors
    /// The first missing or invalid value found
    pub fn validate(self) -> Result<RelayConfig, ConfigError> {
        let relay = self.relay;
        let server = self.server;

        let address = relay.address.as_deref().unwrap_or(defaults::ADDRESS);
        let address: IpAddr = address
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("relay.address", format!("'{address}' is not an IP address")))?;
        let listen = SocketAddr::new(address, relay.port.unwrap_or(defaults::PORT));

        let from_address = relay
            .from_address
            .ok_or(ConfigError::MissingField("relay.from_address"))?;
        let from_address = parse_mailbox("relay.from_address", &from_address)?;

        let domains = relay
            .domains
            .ok_or(ConfigError::MissingField("relay.domains"))?
            .items()
            .iter()
            .map(|domain| parse_domain(domain))
            .collect::<Result<Vec<_>, _>>()?;
        if domains.is_empty() {
            return Err(ConfigError::MissingField("relay.domains"));
        }

        let subnets = relay
            .subnets
            .ok_or(ConfigError::MissingField("relay.subnets"))?
            .items()
            .iter()
            .map(|subnet| parse_subnet(subnet))
            .collect::<Result<Vec<_>, _>>()?;
        if subnets.is_empty() {
            return Err(ConfigError::MissingField("relay.subnets"));
        }

        let log_level = relay
            .log_level
            .map(|level| {
                logging::parse_level(&level).ok_or_else(|| {
                    ConfigError::invalid("relay.log_level", format!("unknown level '{level}'"))
                })
            })
            .transpose()?;

        let max_length = relay.max_queue_length.unwrap_or(defaults::MAX_QUEUE_LENGTH);
        if max_length == 0 {
            return Err(ConfigError::invalid(
                "relay.max_queue_length",
                "must be at least 1",
            ));
        }

        let workers = relay.workers.unwrap_or(defaults::WORKERS);
        if workers == 0 {
            return Err(ConfigError::invalid("relay.workers", "must be at least 1"));
        }

        let send_timeout = relay.send_timeout.unwrap_or(defaults::SEND_TIMEOUT_SECS);
        if send_timeout == 0 {
            return Err(ConfigError::invalid(
                "relay.send_timeout",
                "must be at least 1 second",
            ));
        }

        let command_timeout = relay
            .command_timeout
            .unwrap_or(defaults::COMMAND_TIMEOUT_SECS);
        if command_timeout == 0 {
            return Err(ConfigError::invalid(
                "relay.command_timeout",
                "must be at least 1 second",
            ));
        }

        let notify = server
            .server_restart_email
            .filter(|address| !address.trim().is_empty())
            .map(|address| parse_mailbox("server.server_restart_email", &address))
            .transpose()?;

        Ok(RelayConfig {
            listen,
            banner: relay.banner.unwrap_or_else(|| defaults::BANNER.to_owned()),
            from_address,
            domains,
            subnets,
            log_level,
            queue: QueueConfig {
                max_length,
                max_age: Duration::from_secs(
                    relay
                        .send_queue_max_age
                        .unwrap_or(defaults::SEND_QUEUE_MAX_AGE_SECS),
                ),
            },
            delivery: DeliveryConfig {
                send_timeout: Duration::from_secs(send_timeout),
                retry_limit: relay.message_retry.unwrap_or(defaults::MESSAGE_RETRY),
                retry_delay: Duration::from_secs(
                    relay
                        .message_retry_delay
                        .unwrap_or(defaults::MESSAGE_RETRY_DELAY_SECS),
                ),
                workers,
            },
            send_log: SendLogConfig {
                enabled: relay.enable_send_log.unwrap_or(defaults::ENABLE_SEND_LOG),
                retention: Duration::from_secs(
                    relay
                        .retain_log_days
                        .unwrap_or(defaults::RETAIN_LOG_DAYS)
                        .saturating_mul(86_400),
                ),
            },
            smtp: SmtpLimits {
                max_message_size: relay.max_message_size.unwrap_or(defaults::MAX_MESSAGE_SIZE),
                command_timeout: Duration::from_secs(command_timeout),
            },
            supervisor: SupervisorConfig {
                restart_budget: server
                    .server_restart_per_hour
                    .unwrap_or(defaults::RESTART_PER_HOUR),
                restart_delay: Duration::from_secs(
                    server
                        .server_restart_delay
                        .unwrap_or(defaults::RESTART_DELAY_SECS),
                ),
                notify,
            },
            api: self.azure.validate()?,
        })
    }
}

impl RawAzure {
    fn validate(self) -> Result<ApiConfig, ConfigError> {
        let endpoint = self
            .endpoint
            .ok_or(ConfigError::MissingField("azure.endpoint"))?;
        let endpoint = Url::parse(endpoint.trim())
            .map_err(|err| ConfigError::invalid("azure.endpoint", err.to_string()))?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(ConfigError::invalid(
                "azure.endpoint",
                format!("'{endpoint}' is not an http(s) URL"),
            ));
        }

        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        let (tenant_id, client_id, client_secret) = (
            non_empty(self.tenant_id),
            non_empty(self.client_id),
            non_empty(self.client_secret),
        );

        let key = non_empty(self.key);

        let credentials = match (tenant_id, client_id, client_secret) {
            (Some(_), Some(_), Some(_)) if key.is_some() => {
                return Err(ConfigError::invalid(
                    "azure",
                    "set either key or a service principal, not both",
                ));
            }
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Credentials::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            },
            (None, None, None) => {
                Credentials::Key(key.ok_or(ConfigError::MissingField("azure.key"))?)
            }
            _ => {
                return Err(ConfigError::invalid(
                    "azure",
                    "tenant_id, client_id and client_secret must all be set to use a service principal",
                ));
            }
        };

        Ok(ApiConfig {
            endpoint,
            api_version: self
                .api_version
                .unwrap_or_else(|| defaults::API_VERSION.to_owned()),
            credentials,
        })
    }
}

fn parse_mailbox(field: &'static str, address: &str) -> Result<String, ConfigError> {
    let address = address.trim();
    match address.rsplit_once('@') {
        Some((local, domain))
            if !local.is_empty()
                && !domain.is_empty()
                && !address.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') =>
        {
            Ok(address.to_owned())
        }
        _ => Err(ConfigError::invalid(
            field,
            format!("'{address}' is not an email address"),
        )),
    }
}

fn parse_domain(domain: &str) -> Result<String, ConfigError> {
    let normalised = domain.trim().to_ascii_lowercase();
    let labels = normalised.strip_prefix('.').unwrap_or(&normalised);

    let valid = !labels.is_empty()
        && labels.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    if valid {
        Ok(normalised)
    } else {
        Err(ConfigError::invalid(
            "relay.domains",
            format!("'{domain}' is not a domain name"),
        ))
    }
}

fn parse_subnet(subnet: &str) -> Result<IpNet, ConfigError> {
    if let Ok(network) = subnet.parse::<IpNet>() {
        return Ok(network);
    }

    let address = subnet.parse::<IpAddr>().map_err(|_| {
        ConfigError::invalid("relay.subnets", format!("'{subnet}' is not an IP network"))
    })?;
    let prefix = if address.is_ipv4() { 32 } else { 128 };

    IpNet::new(address, prefix)
        .map_err(|err| ConfigError::invalid("relay.subnets", err.to_string()))
}

/// Credential material for the email API.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Base64 access key used to sign requests
    Key(String),
    /// Service principal used to obtain a bearer token
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

impl Debug for Credentials {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(_) => fmt.debug_tuple("Key").field(&"<redacted>").finish(),
            Self::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => fmt
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub endpoint: Url,
    pub api_version: String,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_length: usize,
    pub max_age: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub send_timeout: Duration,
    pub retry_limit: u32,
    pub retry_delay: Duration,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendLogConfig {
    pub enabled: bool,
    pub retention: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmtpLimits {
    pub max_message_size: usize,
    pub command_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub restart_budget: usize,
    pub restart_delay: Duration,
    /// Operator address that receives a report after each restart
    pub notify: Option<String>,
}

/// The validated, immutable relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub banner: String,
    pub from_address: String,
    pub domains: Vec<String>,
    pub subnets: Vec<IpNet>,
    pub log_level: Option<LevelFilter>,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub send_log: SendLogConfig,
    pub smtp: SmtpLimits,
    pub supervisor: SupervisorConfig,
    pub api: ApiConfig,
}

impl RelayConfig {
    /// Load `path` (if any), lay `overrides` on top and validate the result.
    ///
    /// # Errors
    /// See [`RawConfig::from_file`] and [`RawConfig::validate`]
    pub fn load(path: Option<&Path>, overrides: RawConfig) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => RawConfig::from_file(path)?,
            None => RawConfig::default(),
        };

        base.merge(overrides).validate()
    }
}
