//! Sidedoor client
//!
//! The initiator peer: exposes a local SOCKS5 endpoint and opens a
//! tunnel through the carrier for every CONNECT.

use anyhow::{Context, Result};
use clap::Parser;
use sidedoor::carrier::TcpMiddleman;
use sidedoor::config::{ClientConfig, Config};
use sidedoor::proxy::{bridge_connect, Socks5Server};
use sidedoor::tunnel::Manager;
use tracing::{error, info};

/// Sidedoor client - covert SOCKS5 tunnel, initiator side
#[derive(Parser, Debug)]
#[command(name = "sidedoor-client")]
#[command(about = "Covert SOCKS5 tunnel over innocuous carriers - client")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Local SOCKS5 listen address (overrides config)
    #[arg(long)]
    socks_addr: Option<String>,

    /// Carrier endpoint to dial (overrides config)
    #[arg(long)]
    carrier_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path).context("load configuration")?,
        None => Config::default(),
    };
    let client_config = config.client.clone().unwrap_or_else(ClientConfig::default);

    let socks_addr = args.socks_addr.unwrap_or(client_config.socks_listen);
    let carrier_addr = args.carrier_addr.unwrap_or(client_config.carrier_addr);

    info!("sidedoor client v{}", sidedoor::VERSION);
    info!(carrier = %carrier_addr, "dialing carrier");

    let manager = Manager::new(config.tunnel.clone());
    manager
        .serve(TcpMiddleman::dial(carrier_addr))
        .await
        .context("set up middleman")?;

    info!("starting SOCKS5 proxy on socks5://{}", socks_addr);
    let server = Socks5Server::bind(&socks_addr)
        .await
        .context("bind SOCKS5 listener")?;

    let handler_manager = manager.clone();
    let serve = server.run(move |stream, destination| {
        let manager = handler_manager.clone();
        async move { bridge_connect(manager, stream, destination).await }
    });

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("SOCKS5 server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    manager.shutdown();
    Ok(())
}
