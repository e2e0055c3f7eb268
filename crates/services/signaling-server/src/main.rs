//! Signaling relay binary
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address
//! remotedesk-signaling
//!
//! # Custom address and presence window
//! REMOTEDESK_RELAY_ADDR=0.0.0.0:9000 REMOTEDESK_PRESENCE_TTL_SECS=60 remotedesk-signaling
//! ```
//!
//! `RUST_LOG` controls verbosity (default: `info`). `--json-logs` switches
//! to JSON output.

use clap::Parser;
use remotedesk_core::{SignalingHub, SystemClock};
use remotedesk_signaling_server::RelayServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "remotedesk-signaling", version, about = "RemoteDesk signaling relay")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "REMOTEDESK_RELAY_ADDR", default_value = "0.0.0.0:8765")]
    addr: String,

    /// Seconds without a heartbeat before a device is considered offline
    #[arg(long, env = "REMOTEDESK_PRESENCE_TTL_SECS", default_value_t = 45)]
    presence_ttl_secs: i64,

    /// Seconds between presence sweeps
    #[arg(long, env = "REMOTEDESK_PRUNE_INTERVAL_SECS", default_value_t = 15)]
    prune_interval_secs: u64,

    /// Emit JSON logs
    #[arg(long, env = "REMOTEDESK_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        presence_ttl_secs = args.presence_ttl_secs,
        "RemoteDesk signaling relay starting"
    );

    if args.prune_interval_secs == 0 {
        anyhow::bail!("prune interval must be > 0");
    }

    let hub = Arc::new(SignalingHub::new(
        chrono::Duration::seconds(args.presence_ttl_secs),
        Arc::new(SystemClock),
    ));
    let server = RelayServer::bind(
        &args.addr,
        hub,
        Duration::from_secs(args.prune_interval_secs),
    )
    .await?;

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Signaling relay shut down");
    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
