//! Galena full node binary.
//!
//! Opens RocksDB storage, initializes the chain, and runs the node
//! event loop until interrupted. The P2P transport is pluggable; with
//! no transport configured the node runs standalone and still serves
//! local submissions.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use galena_node::{Node, NodeConfig, RocksStorage, StaticPeerManager};

/// Galena full node.
#[derive(Parser, Debug)]
#[command(name = "galena-node", version, about = "Galena full node with RocksDB storage")]
struct Args {
    /// Path to a config file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for chain storage
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Maintain and emit the per-address accounting index
    #[arg(long)]
    live_accounting: bool,
}

fn init_tracing(filter: &str, format: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }
    if args.live_accounting {
        config.live_accounting = true;
    }

    init_tracing(&config.log_level, &args.log_format);

    let storage = match RocksStorage::open(config.db_path()) {
        Ok(storage) => Arc::new(storage),
        Err(error) => {
            error!(%error, path = %config.db_path().display(), "failed to open storage");
            process::exit(1);
        }
    };

    let peers = Arc::new(StaticPeerManager::new());
    let node = Node::new(&config, storage, peers).context("assembling node")?;
    node.start().context("starting node")?;

    if let Some(tip) = node.chain().tip() {
        info!(height = tip.height, hash = %tip.hash, "chain ready");
    }

    let (_event_tx, event_rx) = mpsc::unbounded_channel();
    let loop_handle = Arc::clone(&node).run(event_rx);

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    loop_handle.abort();
    Ok(())
}
