//! crane-relay: bridge a crane controller's TCP telemetry link to WebSocket clients.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crane_relay::providers::FileTarget;
use crane_relay::{CraneRelay, Gateway, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file; defaults apply when it does not exist
    #[arg(short, long, env = "CRANE_RELAY_CONFIG", default_value = "crane-relay.yaml")]
    config: PathBuf,

    /// Address for the WebSocket listener
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Controller host. Pins the target: the config file is no longer re-read
    #[arg(long)]
    upstream_host: Option<String>,

    /// Controller port. Pins the target like --upstream-host
    #[arg(long)]
    upstream_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut config = RelayConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    if let Some(bind) = cli.bind {
        config.gateway.bind = bind;
    }
    let pinned = cli.upstream_host.is_some() || cli.upstream_port.is_some();
    if let Some(host) = cli.upstream_host {
        config.upstream.host = host;
    }
    if let Some(port) = cli.upstream_port {
        config.upstream.port = port;
    }
    config.validate().context("invalid command-line overrides")?;

    info!("crane-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(upstream = %config.upstream.target(), bind = %config.gateway.bind, pinned, "Starting");

    let relay = if pinned {
        CraneRelay::connect(&config)
    } else {
        CraneRelay::start(&config, FileTarget::new(&cli.config, config.upstream.clone()))
    };

    let listener = Gateway::bind(&config.gateway).await?;
    let coordinator = Arc::new(relay.shutdown_coordinator());
    let signals = Arc::clone(&coordinator).listen_for_signals();

    tokio::select! {
        served = relay.serve(listener) => served.context("WebSocket gateway failed")?,
        listening = signals => listening.context("signal listener panicked")??,
    }

    if coordinator.is_shutting_down() {
        let outcome = coordinator.wait().await;
        info!(?outcome, "crane-relay stopped");
    }

    Ok(())
}
