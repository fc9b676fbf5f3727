//! bm-node - a store-and-forward messaging node.
//!
//! This is the main entry point for the bm-node binary.

use anyhow::{Context, Result};
use bm_storage::parse_peer_address;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Store-and-forward messaging node.
#[derive(Parser, Debug)]
#[command(name = "bm-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "bm-node.toml")]
    config: PathBuf,

    /// P2P listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// P2P bind address
    #[arg(long)]
    bind: Option<String>,

    /// Peer to connect to on start-up (repeatable)
    #[arg(long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,

    /// Synchronize once with a trusted host and exit
    #[arg(long, value_name = "HOST:PORT")]
    sync: Option<String>,

    /// Timeout for --sync, in seconds
    #[arg(long)]
    sync_timeout: Option<u64>,

    /// Number of proof-of-work threads (0 = one per core)
    #[arg(long)]
    pow_threads: Option<usize>,

    /// Do not resolve the DNS bootstrap hosts
    #[arg(long)]
    no_bootstrap: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Log level, or a full tracing filter directive
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG wins over --log-level.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting bm-node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load(&args.config, &args)?;
    if args.init_config {
        config.save(&args.config)?;
        info!("Configuration written to {:?}", args.config);
        return Ok(());
    }
    info!(
        "P2P: {}:{}, streams {:?}",
        config.network.bind_address, config.network.port, config.network.streams
    );

    let node = Node::new(config).await?;

    if let Some(ref host) = args.sync {
        let addr = parse_peer_address(host)
            .with_context(|| format!("Cannot resolve sync host {}", host))?;
        let timeout = Duration::from_secs(node.config().network.sync_timeout_secs);
        let received = node.synchronize(addr, timeout).await?;
        info!(host = %addr, objects = received, "Sync finished");
        node.shutdown().await;
        return Ok(());
    }

    // Handle shutdown signals
    let node_handle = node.clone();
    let shutdown_signal = async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        node_handle.shutdown().await;
    };

    // Run the node until shutdown
    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {:#}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown complete");
        }
    }

    info!("bm-node stopped");
    Ok(())
}
