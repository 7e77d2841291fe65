//! driftsync-agent: replica for driftsync
//!
//! Connects to a `driftsync serve` instance, mirrors its file list under a
//! local root and pulls the regions whose digests differ.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use tracing::{info, warn};

use driftsync_core::{Replica, SyncConfig};
use driftsync_transport::{RpcClient, TcpChannel};

#[derive(Parser)]
#[command(name = "driftsync-agent")]
#[command(about = "Replica agent for driftsync file synchronization")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a served directory until interrupted
    Replicate {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:7420")]
        server: String,

        /// Local directory to write into
        #[arg(short, long)]
        root: PathBuf,

        /// Concurrent puller workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Region size in bytes (must match the server)
        #[arg(long)]
        region_size: Option<u64>,

        /// Quick digest sample size in bytes (must match the server)
        #[arg(long)]
        sample_size: Option<u64>,
    },
    /// Print version and exit
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("driftsync-agent {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Replicate {
            server,
            root,
            workers,
            region_size,
            sample_size,
        } => {
            let mut config = load_config(&root)?;
            if let Some(workers) = workers {
                config.replica.workers = workers;
            }
            if let Some(size) = region_size {
                config.engine.region_size = size;
            }
            if let Some(size) = sample_size {
                config.engine.sample_size = size;
            }
            config.validate()?;
            run_replica(&server, &root, &config).await?;
        }
    }

    Ok(())
}

fn load_config(root: &Path) -> Result<SyncConfig> {
    std::fs::create_dir_all(root)
        .wrap_err_with(|| format!("Failed to create {}", root.display()))?;
    SyncConfig::load(root).wrap_err_with(|| format!("Failed to load config under {}", root.display()))
}

async fn run_replica(server: &str, root: &Path, config: &SyncConfig) -> Result<()> {
    info!("driftsync-agent replicating {server} into {}", root.display());

    let channel = TcpChannel::connect(server)
        .await?
        .with_call_timeout(config.replica.call_timeout());
    let remote = RpcClient::new(channel);
    let replica = Arc::new(Replica::new(root, Arc::new(remote), config));
    let handles = replica.start().await?;
    info!(
        "Running as client {} with {} workers",
        replica.client_id(),
        config.replica.workers.max(1)
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Unable to listen for ctrl-c: {e}");
    }

    replica.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Replica task ended abnormally: {e}");
        }
    }
    let stats = replica.stats().snapshot();
    info!("driftsync-agent shutting down after writing {} bytes", stats.bytes_transferred);
    Ok(())
}
