//! ClipMesh - Encrypted peer-to-peer clipboard mesh
//!
//! This is the main entry point for the ClipMesh daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipmesh::clipboard::SystemClipboard;
use clipmesh::{Config, Node};

#[derive(Parser, Debug)]
#[command(name = "clipmesh", version, about = "Encrypted peer-to-peer clipboard mesh")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:7777
    #[arg(short, long)]
    listen: Option<String>,

    /// Peer address to connect to (repeatable)
    #[arg(short = 'p', long = "peer")]
    peers: Vec<String>,

    /// Shared secret for mutual authentication
    #[arg(short, long)]
    secret: Option<String>,

    /// Clipboard poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .await
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if !cli.peers.is_empty() {
        config.connect = cli.peers.clone();
    }
    if cli.secret.is_some() {
        config.secret = cli.secret;
    }
    if let Some(interval) = cli.poll_interval_ms {
        config.poll_interval_ms = interval;
    }

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipmesh={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("ClipMesh v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("invalid configuration")?;

    let node = Node::new(config.clone(), Arc::new(SystemClipboard::new()))
        .context("failed to initialize node")?;

    for peer in &config.connect {
        let addr: SocketAddr = peer.parse().with_context(|| format!("bad peer address {peer}"))?;
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = node.connect_to(addr).await {
                warn!(%addr, error = %e, "peer connection ended");
            }
        });
    }

    node.run().await.context("node terminated")?;
    Ok(())
}
