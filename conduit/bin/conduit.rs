#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(unix))]
compile_error!("Only unix platforms are currently supported");

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::Parser;
use conduit::{Supervisor, SupervisorError};
use conduit_common::{
    clock::{Clock, SystemClock},
    config::{RawAzure, RawConfig, RawRelay, RawServer, RelayConfig, StringList},
    internal, logging,
};
use conduit_delivery::EmailApiClient;

/// Internal SMTP relay forwarding approved mail to a cloud email API
///
/// Settings given on the command line override those in the configuration
/// file. List values take comma separated items.
#[derive(Parser, Debug)]
#[command(name = "conduit", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Hostname announced in the SMTP greeting
    #[arg(long)]
    banner: Option<String>,

    /// Verified sender address every message is sent from
    #[arg(long)]
    from_address: Option<String>,

    /// Recipient domains mail is relayed for
    #[arg(long)]
    domains: Option<String>,

    /// Networks allowed to submit mail
    #[arg(long)]
    subnets: Option<String>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    max_queue_length: Option<usize>,

    #[arg(long)]
    enable_send_log: Option<bool>,

    #[arg(long)]
    retain_log_days: Option<u64>,

    /// Seconds a message may wait in the queue before it is dropped
    #[arg(long)]
    send_queue_max_age: Option<u64>,

    /// Seconds allowed for one send attempt
    #[arg(long)]
    send_timeout: Option<u64>,

    /// Attempts made for each message
    #[arg(long)]
    message_retry: Option<u32>,

    /// Seconds between attempts
    #[arg(long)]
    message_retry_delay: Option<u64>,

    /// Number of delivery workers
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_message_size: Option<usize>,

    /// Seconds a client may stay silent before being disconnected
    #[arg(long)]
    command_timeout: Option<u64>,

    #[arg(long)]
    server_restart_per_hour: Option<usize>,

    /// Operator address told about restarts
    #[arg(long)]
    server_restart_email: Option<String>,

    #[arg(long)]
    server_restart_delay: Option<u64>,

    /// Email API endpoint
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    api_version: Option<String>,

    /// Base64 access key for the email API
    #[arg(long)]
    key: Option<String>,

    #[arg(long)]
    tenant_id: Option<String>,

    #[arg(long)]
    client_id: Option<String>,

    #[arg(long)]
    client_secret: Option<String>,
}

impl Cli {
    fn overrides(self) -> RawConfig {
        RawConfig {
            relay: RawRelay {
                address: self.address,
                port: self.port,
                banner: self.banner,
                from_address: self.from_address,
                domains: self.domains.map(StringList::One),
                subnets: self.subnets.map(StringList::One),
                log_level: self.log_level,
                max_queue_length: self.max_queue_length,
                enable_send_log: self.enable_send_log,
                retain_log_days: self.retain_log_days,
                send_queue_max_age: self.send_queue_max_age,
                send_timeout: self.send_timeout,
                message_retry: self.message_retry,
                message_retry_delay: self.message_retry_delay,
                workers: self.workers,
                max_message_size: self.max_message_size,
                command_timeout: self.command_timeout,
            },
            server: RawServer {
                server_restart_per_hour: self.server_restart_per_hour,
                server_restart_email: self.server_restart_email,
                server_restart_delay: self.server_restart_delay,
            },
            azure: RawAzure {
                endpoint: self.endpoint,
                api_version: self.api_version,
                key: self.key,
                tenant_id: self.tenant_id,
                client_id: self.client_id,
                client_secret: self.client_secret,
            },
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                internal!(level = WARN, "Unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        () = terminate => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }
}

async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sender = EmailApiClient::new(&config.api, Arc::clone(&clock))
        .context("Unable to create email API client")?;

    internal!(
        level = INFO,
        version = env!("CARGO_PKG_VERSION"),
        endpoint = %config.api.endpoint,
        "conduit starting"
    );

    Supervisor::new(config, Arc::new(sender), clock)
        .run(shutdown())
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let path = cli.config.clone();

    let config = match RelayConfig::load(path.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.log_level);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.downcast_ref::<SupervisorError>().is_some() => {
            internal!(level = ERROR, "{err:#}");
            ExitCode::from(2)
        }
        Err(err) => {
            internal!(level = ERROR, "{err:#}");
            ExitCode::FAILURE
        }
    }
}
