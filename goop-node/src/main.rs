use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Peer-to-peer presence node.
#[derive(Debug, Parser)]
#[command(name = "goop-node", version)]
struct Args {
    /// Peer directory holding config.json, identity, database, and site.
    #[arg(long, default_value = ".goop", env = "GOOP_PEER_DIR")]
    peer_dir: PathBuf,

    /// Override the p2p listen port (0 = ephemeral).
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override the mDNS cohort tag.
    #[arg(long)]
    mdns_tag: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (GOOP_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("GOOP_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("goop_node=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let args = Args::parse();
    let mut config = goop_node::config::Config::load(&args.peer_dir)?;
    if let Some(port) = args.listen_port {
        config.p2p.listen_port = port;
    }
    if let Some(tag) = args.mdns_tag {
        config.p2p.mdns_tag = tag;
    }

    tracing::info!(peer_dir = %args.peer_dir.display(), "starting node");
    let node = goop_node::Node::start_with_config(args.peer_dir, config).await?;
    tracing::info!(id = %node.local_id(), "node running; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
