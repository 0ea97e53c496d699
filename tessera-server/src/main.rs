//! Tessera collaboration server.
//!
//! Runs one hub and one websocket gateway. Users are provisioned from the
//! command line as `TOKEN=USER_ID:EMAIL[:NAME]`; clients either exchange the
//! token for a ticket out of band or connect with `?token=` directly.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tessera_collab::auth::TicketStore;
use tessera_collab::hub::{Hub, HubConfig};
use tessera_collab::presence::Identity;
use tessera_collab::server::{Gateway, ServerConfig};
use tessera_collab::session::SessionConfig;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "tessera-server", about = "Real-time workspace collaboration server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TESSERA_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Outbound messages buffered per session before it is evicted
    #[arg(long, env = "TESSERA_MAILBOX_CAPACITY", default_value_t = 256)]
    mailbox_capacity: usize,

    /// Pending hub broadcasts before new ones are dropped
    #[arg(long, env = "TESSERA_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Largest accepted client frame in bytes
    #[arg(long, env = "TESSERA_MAX_FRAME_SIZE", default_value_t = 8 * 1024)]
    max_frame_size: usize,

    /// Seconds without a probe reply before a session is dropped
    #[arg(long, env = "TESSERA_PONG_WAIT_SECS", default_value_t = 60)]
    pong_wait_secs: u64,

    /// Seconds allowed for a single socket write
    #[arg(long, env = "TESSERA_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    write_timeout_secs: u64,

    /// Lifetime of an issued connection ticket
    #[arg(long, env = "TESSERA_TICKET_TTL_SECS", default_value_t = 30)]
    ticket_ttl_secs: u64,

    /// Accepted credential, TOKEN=USER_ID:EMAIL[:NAME] (repeatable)
    #[arg(
        long = "credential",
        env = "TESSERA_CREDENTIALS",
        value_delimiter = ',',
        value_parser = parse_credential
    )]
    credentials: Vec<(String, Identity)>,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let pong_wait = Duration::from_secs(self.pong_wait_secs);
        ServerConfig {
            bind_addr: self.bind.clone(),
            hub: HubConfig {
                broadcast_capacity: self.broadcast_capacity,
                ..HubConfig::default()
            },
            session: SessionConfig {
                mailbox_capacity: self.mailbox_capacity,
                max_frame_size: self.max_frame_size,
                write_timeout: Duration::from_secs(self.write_timeout_secs),
                pong_wait,
                ping_period: pong_wait * 9 / 10,
                ..SessionConfig::default()
            },
        }
    }
}

fn parse_credential(raw: &str) -> Result<(String, Identity), String> {
    let (token, identity) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected TOKEN=USER_ID:EMAIL[:NAME], got '{raw}'"))?;
    let mut parts = identity.splitn(3, ':');
    let user_id = parts.next().unwrap_or_default();
    let email = parts.next().unwrap_or_default();
    if token.is_empty() || user_id.is_empty() || email.is_empty() {
        return Err(format!("expected TOKEN=USER_ID:EMAIL[:NAME], got '{raw}'"));
    }

    let mut identity = Identity::new(user_id, email);
    if let Some(name) = parts.next().filter(|name| !name.is_empty()) {
        identity = identity.with_name(name);
    }
    Ok((token.to_string(), identity))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = args.server_config();
    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    let tickets = Arc::new(TicketStore::new(Duration::from_secs(args.ticket_ttl_secs)));
    for (token, identity) in &args.credentials {
        tickets.grant_credential(token.clone(), identity.clone());
    }
    if args.credentials.is_empty() {
        log::warn!("No credentials configured; every upgrade will be rejected");
    } else {
        log::info!("Loaded {} credential(s)", args.credentials.len());
    }

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind {}: {e}", config.bind_addr);
            return ExitCode::FAILURE;
        }
    };

    let hub = Hub::spawn(config.hub.clone());
    let gateway = Gateway::new(config, hub.clone(), tickets);
    if let Err(e) = gateway.serve(listener, shutdown_signal()).await {
        log::error!("Gateway stopped: {e}");
        return ExitCode::FAILURE;
    }

    let stats = hub.stats();
    log::info!(
        "Shut down with {} active session(s); delivered {}, dropped {}, evicted {}",
        stats.active_sessions,
        stats.messages_delivered,
        stats.messages_dropped,
        stats.evictions
    );
    ExitCode::SUCCESS
}
