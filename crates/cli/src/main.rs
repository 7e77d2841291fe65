//! driftsync: region-based differential file sync
//!
//! Serves a directory to replicas over TCP and inspects the region layout
//! the engine computes for it.

mod debug_log;
mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, bail};
use serde::Serialize;
use tracing::{info, warn};

use driftsync_core::directory::ScanMode;
use driftsync_core::{ClientId, SyncConfig, SyncEngine, SyncService, TrackedFile};
use driftsync_transport::{TcpServer, connect};

use crate::progress::{ScanProgress, ServeProgress};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

const DEFAULT_LISTEN: &str = "127.0.0.1:7420";

#[derive(Parser)]
#[command(name = "driftsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Region-based differential file sync")]
#[command(long_about = r#"
driftsync keeps replicas of a directory in sync by comparing per-region
digests and shipping only the regions that differ.

Examples:
  driftsync serve ./data                      Serve ./data on 127.0.0.1:7420
  driftsync serve ./data --listen 0.0.0.0:9000
  driftsync scan ./data --format json         Print the region table
  driftsync progress --client 1234567         Ask a server for a client's progress
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a directory to replicas
    Serve {
        /// Directory to serve
        root: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        listen: String,

        /// Region size in bytes (replicas must use the same value)
        #[arg(long)]
        region_size: Option<u64>,
    },

    /// Scan a directory once and print its regions
    Scan {
        /// Directory to scan
        root: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Summary)]
        format: Format,
    },

    /// Print a client's progress as seen by a server
    Progress {
        /// Server address
        #[arg(short, long, default_value = DEFAULT_LISTEN)]
        server: String,

        /// Client id
        #[arg(short, long)]
        client: ClientId,
    },

    /// Show version and build info
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Summary,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let session = debug_log::SessionLog::install(cli.verbose);

    match cli.command {
        Commands::Version => {
            eprintln!("driftsync {}", env!("CARGO_PKG_VERSION"));
            eprintln!("Built with Rust {}", env!("CARGO_PKG_RUST_VERSION"));
        }
        Commands::Serve {
            root,
            listen,
            region_size,
        } => {
            info!("Session log: {}", session.path().display());
            serve_command(&root, &listen, region_size).await?;
        }
        Commands::Scan { root, format } => {
            scan_command(&root, format).await?;
        }
        Commands::Progress { server, client } => {
            progress_command(&server, client).await?;
        }
    }

    drop(session);
    Ok(())
}

fn load_config(root: &Path) -> Result<SyncConfig> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    SyncConfig::load(root).wrap_err_with(|| format!("Failed to load config under {}", root.display()))
}

async fn serve_command(root: &Path, listen: &str, region_size: Option<u64>) -> Result<()> {
    let mut config = load_config(root)?;
    if let Some(size) = region_size {
        config.engine.region_size = size;
    }
    config.validate()?;

    let engine = Arc::new(SyncEngine::new(root, &config));
    let server = TcpServer::bind(listen, engine.clone()).await?;
    let addr = server.local_addr()?.to_string();
    let listener_cancel = server.cancellation();
    let listener = tokio::spawn(server.run());
    let loops = engine.start();

    let status = ServeProgress::new(&addr);
    let mut ticker = tokio::time::interval(engine.config().progress_interval().max(Duration::from_millis(250)));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Unable to listen for ctrl-c: {e}");
                }
                break;
            }
            _ = ticker.tick() => {
                status.update(
                    &addr,
                    engine.clients().len(),
                    engine.stats().snapshot().bytes_transferred,
                    &engine.in_flight_files(),
                );
            }
        }
    }

    listener_cancel.cancel();
    engine.shutdown();
    for handle in loops {
        if let Err(e) = handle.await {
            warn!("Engine task ended abnormally: {e}");
        }
    }
    match listener.await {
        Ok(result) => result?,
        Err(e) => warn!("Listener task ended abnormally: {e}"),
    }
    engine.stats().report();
    status.finish();
    Ok(())
}

#[derive(Serialize)]
struct RegionRow {
    offset: u64,
    size: u64,
    quick_digest: Option<i32>,
    slow_digest: Option<String>,
}

#[derive(Serialize)]
struct FileRow {
    id: i32,
    name: String,
    size: u64,
    regions: Vec<RegionRow>,
}

impl FileRow {
    fn from_file(file: &TrackedFile) -> Self {
        Self {
            id: file.id(),
            name: file.name().display().to_string(),
            size: file.size(),
            regions: file
                .regions()
                .into_iter()
                .map(|r| RegionRow {
                    offset: r.offset,
                    size: r.size,
                    quick_digest: r.quick_digest,
                    slow_digest: r.slow_digest.map(|d| d.to_hex()),
                })
                .collect(),
        }
    }
}

async fn scan_command(root: &Path, format: Format) -> Result<()> {
    let config = load_config(root)?;
    let engine = SyncEngine::new(root, &config);
    let progress = ScanProgress::new();
    progress.scanning(root);

    let fast = engine.run_scan_cycle(ScanMode::Fast).await;
    let slow = engine.run_scan_cycle(ScanMode::Slow).await;
    if fast.files_failed + slow.files_failed > 0 {
        warn!(
            "{} files could not be read",
            fast.files_failed.max(slow.files_failed)
        );
    }

    let mut files = engine.files().files();
    files.sort_by(|a, b| a.name().cmp(b.name()));
    let rows: Vec<FileRow> = files.iter().map(|f| FileRow::from_file(f)).collect();

    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Format::Summary => {
            for row in &rows {
                println!(
                    "{} ({}, {} regions)",
                    row.name,
                    humansize::format_size(row.size, humansize::BINARY),
                    row.regions.len()
                );
                for region in &row.regions {
                    println!(
                        "  {:>12} +{:<10} quick {:>11} slow {}",
                        region.offset,
                        region.size,
                        region
                            .quick_digest
                            .map_or_else(|| "-".to_string(), |q| q.to_string()),
                        region.slow_digest.as_deref().map_or("-", |s| &s[..16]),
                    );
                }
            }
        }
    }

    let regions = rows.iter().map(|r| r.regions.len()).sum();
    let bytes = rows.iter().map(|r| r.size).sum();
    progress.finish(rows.len(), regions, bytes);
    Ok(())
}

async fn progress_command(server: &str, client: ClientId) -> Result<()> {
    let remote = connect(server).await?;
    let report = remote.progress(client).await?;
    if report.is_empty() {
        eprintln!("Client {client} has no files yet");
    } else {
        print!("{}", progress::render_progress(&report));
    }
    Ok(())
}
