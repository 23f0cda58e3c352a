//! RelayMQ Node Entry Point
//!
//! Starts one cluster node: durable store, consensus, background tasks,
//! and the HTTP API. Exits 0 on clean shutdown, non-zero on bind failure
//! or a fatal persistence error.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use relaymq::{ApiServer, Node, NodeConfig, ReplicationMode};

/// RelayMQ - fault-tolerant distributed messaging node
#[derive(Parser)]
#[command(name = "relaymq")]
#[command(version)]
#[command(about = "Fault-tolerant distributed messaging node", long_about = None)]
struct Cli {
    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(long, default_value_t = 7600)]
    port: u16,

    /// Stable node identifier
    #[arg(long)]
    id: String,

    /// Comma-separated peer base URLs
    #[arg(long, value_delimiter = ',', default_value = "")]
    peers: Vec<String>,

    /// Commit policy for client writes
    #[arg(long, alias = "replication_mode", value_enum, default_value = "async")]
    replication_mode: ReplicationMode,

    /// Quorum size; majority of the cluster when omitted
    #[arg(long)]
    quorum: Option<usize>,

    /// Directory for the durable store
    #[arg(long, alias = "data_dir", default_value = "./relaymq-data")]
    data_dir: PathBuf,

    /// Ordering buffer hold-back window in milliseconds
    #[arg(long, alias = "hold_back_ms", default_value_t = 5000)]
    hold_back_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let peers: Vec<String> = cli.peers.into_iter().filter(|p| !p.is_empty()).collect();
    let config = NodeConfig {
        node_id: cli.id,
        host: cli.host,
        port: cli.port,
        peers,
        data_dir: cli.data_dir,
        replication_mode: cli.replication_mode,
        quorum: cli.quorum,
        hold_back: Duration::from_millis(cli.hold_back_ms),
        ..Default::default()
    };

    let node = Node::new(config)?;
    node.start();

    let server = ApiServer::new(node.clone())?;
    let shutdown_node = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            shutdown_node.shutdown();
        }
    });

    server.run().await?;

    if node.is_fatal() {
        anyhow::bail!("node stopped after a fatal persistence error");
    }
    info!("clean shutdown");
    Ok(())
}
