//! raftlinkd — the raftlink daemon.
//!
//! Runs one cluster node: messaging, discovery-driven membership, the
//! cluster event service, and the consensus RPC endpoints including
//! snapshot file serving.
//!
//! # Usage
//!
//! ```text
//! raftlinkd run --config raftlinkd.toml --serve-dir /var/lib/raftlink/snapshot
//! raftlinkd check-config --config raftlinkd.toml
//! ```

mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use raftlink_cluster::{Cluster, ClusterMembershipEvent, ClusterMembershipService};
use raftlink_core::ClusterConfig;
use raftlink_rpc::{FileService, LocalDirReader, RaftRpcService};
use tokio::runtime::Handle;
use tracing::info;

use crate::server::NoGroupServer;

#[derive(Parser)]
#[command(name = "raftlinkd", about = "raftlink cluster node daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a node and run until interrupted.
    Run {
        /// Path to the TOML config file.
        #[arg(long)]
        config: PathBuf,

        /// Directory to serve to peers over `getFile`.
        #[arg(long)]
        serve_dir: Option<PathBuf>,
    },
    /// Validate a config file and print the resolved member set.
    CheckConfig {
        /// Path to the TOML config file.
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,raftlink=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, serve_dir } => run(&config, serve_dir).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: &Path) -> anyhow::Result<ClusterConfig> {
    let config = ClusterConfig::from_file(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(config)
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    println!("cluster: {}", config.cluster_id);
    println!(
        "local:   {} @ {}",
        config.node.id.as_deref().unwrap_or("<generated>"),
        config.node.address
    );
    for node in config.discovery.to_nodes() {
        println!("peer:    {} @ {}", node.id, node.address);
    }
    Ok(())
}

async fn run(path: &Path, serve_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(path)?;
    info!(cluster_id = %config.cluster_id, "raftlink daemon starting");

    let cluster = Cluster::from_config(config)?;
    cluster.start().await.context("failed to start cluster node")?;

    // ── Membership logging ─────────────────────────────────────

    let membership = cluster.membership();
    let listener = membership.add_listener(Arc::new(|event: &ClusterMembershipEvent| {
        info!(
            event = %event.kind,
            member_id = %event.member.id(),
            address = %event.member.address(),
            "membership changed"
        );
    }));
    for member in membership.members() {
        info!(member_id = %member.id(), address = %member.address(), "member");
    }

    // ── Consensus endpoints ────────────────────────────────────

    let files = Arc::new(FileService::new());
    if let Some(dir) = serve_dir {
        let reader_id = files.add_reader(Arc::new(LocalDirReader::new(&dir)));
        info!(path = %dir.display(), reader_id, "serving directory");
    }
    let membership_view: Arc<dyn ClusterMembershipService> = membership.clone();
    let rpc = RaftRpcService::new(
        cluster.messaging(),
        membership_view,
        Arc::new(NoGroupServer),
        files,
        Handle::current(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");

    rpc.close();
    membership.remove_listener(listener);
    cluster.stop().await;

    info!("raftlink daemon stopped");
    Ok(())
}
