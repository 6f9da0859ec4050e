#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sable_node::node::unix_now;
use sable_node::{Node, NodeConfig, StorageKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Node configuration resolved from CLI/env/file/defaults.
#[derive(Parser, Debug)]
#[command(name = "sable-node", version)]
struct Cli {
    /// JSON config file
    #[arg(long = "config")]
    config: Option<PathBuf>,
    /// Data directory for the chain database
    #[arg(long = "data-dir")]
    data_dir: Option<PathBuf>,
    /// mainnet, testnet or regtest
    #[arg(long = "network")]
    network: Option<String>,
    /// sled or memory
    #[arg(long = "storage")]
    storage: Option<String>,
    /// Mempool byte budget
    #[arg(long = "mempool-max-bytes")]
    mempool_max_bytes: Option<usize>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the chain and print the head as JSON (default).
    Status,
    /// Print the resolved configuration as JSON.
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    if let Some(Command::Config) = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let node = Node::open(&config).context("opening node")?;
    let chain = node.chain();
    info!(head = %chain.head(), height = chain.head_height(), "chain ready");
    let head_age = chain
        .block(&chain.head())
        .map(|b| unix_now().saturating_sub(b.header.timestamp));
    let status = serde_json::json!({
        "network": config.network,
        "genesis": chain.genesis_hash().to_string(),
        "head": chain.head().to_string(),
        "height": chain.head_height(),
        "head_age_secs": head_age,
        "work": chain.cumulative_work(&chain.head()).map(|w| w.to_string()),
        "commitments": chain.state().tree().len(),
        "nullifiers": chain.state().nullifiers().len(),
        "mempool_max_bytes": config.mempool_max_bytes,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// CLI flags win over `SABLE_*` variables, which win over the config file.
fn resolve_config(cli: &Cli) -> Result<NodeConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| env::var("SABLE_CONFIG").ok().map(PathBuf::from));
    let mut config = match path {
        Some(path) => NodeConfig::load(&path)?,
        None => NodeConfig::default(),
    };

    if let Some(dir) = cli
        .data_dir
        .clone()
        .or_else(|| env::var("SABLE_DATA_DIR").ok().map(PathBuf::from))
    {
        config.data_dir = dir;
    }
    if let Some(network) = cli
        .network
        .clone()
        .or_else(|| env::var("SABLE_NETWORK").ok())
    {
        config.network = network;
    }
    if let Some(storage) = cli
        .storage
        .clone()
        .or_else(|| env::var("SABLE_STORAGE").ok())
    {
        config.storage = match storage.to_ascii_lowercase().as_str() {
            "sled" => StorageKind::Sled,
            "memory" => StorageKind::Memory,
            other => anyhow::bail!("unknown storage backend {other:?}"),
        };
    }
    if let Some(max) = cli.mempool_max_bytes.or_else(|| {
        env::var("SABLE_MEMPOOL_MAX_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
    }) {
        config.mempool_max_bytes = max;
    }

    config.network().context("resolving network")?;
    Ok(config)
}
