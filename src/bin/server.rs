//! Sidedoor server
//!
//! The responder peer: accepts the carrier, serves inbound Connects by
//! dialing the requested destinations, and egresses the traffic.

use anyhow::{Context, Result};
use clap::Parser;
use sidedoor::carrier::TcpMiddleman;
use sidedoor::config::{Config, ServerConfig};
use sidedoor::tunnel::{exchange, Manager, SocketIo};
use tracing::{error, info};

/// Sidedoor server - covert SOCKS5 tunnel, responder side
#[derive(Parser, Debug)]
#[command(name = "sidedoor-server")]
#[command(about = "Covert SOCKS5 tunnel over innocuous carriers - server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Carrier listen address (overrides config)
    #[arg(long)]
    carrier_listen: Option<String>,

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
    let server_config = config.server.clone().unwrap_or_else(ServerConfig::default);

    let carrier_listen = args.carrier_listen.unwrap_or(server_config.carrier_listen);

    info!("sidedoor server v{}", sidedoor::VERSION);

    // the config file speaks from the client's perspective; this side
    // answers to the other name
    let manager = Manager::new(config.tunnel.clone().flipped());
    manager
        .serve(TcpMiddleman::accept(carrier_listen))
        .await
        .context("set up middleman")?;

    let listener = manager.new_listener();

    let create_manager = manager.clone();
    let exchange_manager = manager.clone();
    let remove_manager = manager.clone();

    let serve = listener.listen_and_serve(
        move |id| create_manager.create(id),
        move |tunnel, conn| {
            let manager = exchange_manager.clone();
            async move {
                let (reader, writer) = conn.into_split();
                let socket = SocketIo {
                    reader,
                    writer,
                    read_buffer_size: manager.write_space(),
                };
                exchange(tunnel, socket, manager.idle_timeout()).await
            }
        },
        move |tunnel| remove_manager.remove(tunnel),
    );

    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                error!("listener stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    manager.shutdown();
    Ok(())
}
