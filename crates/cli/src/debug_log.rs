//! Per-session trace log
//!
//! Every `driftsync` invocation writes a full trace to
//! `<tmp>/driftsync-<uuid>.log` while the console only shows info (or debug
//! with `-v`) lines routed above any live progress bar.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use crate::progress::ProgressWriter;

const FILE_DIRECTIVES: &str = "warn,driftsync=trace,driftsync_core=trace,driftsync_transport=trace";

/// Installed logging for one run. Dropping it flushes the log file.
pub struct SessionLog {
    path: PathBuf,
    _flush: WorkerGuard,
}

impl SessionLog {
    /// Install the global subscriber.
    pub fn install(verbose: bool) -> Self {
        let dir = std::env::temp_dir();
        let name = format!("driftsync-{}.log", uuid::Uuid::new_v4());
        let path = dir.join(&name);

        let (writer, flush) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &name));

        let file = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FILE_DIRECTIVES)));

        let console = tracing_subscriber::fmt::layer()
            .with_writer(ProgressWriter)
            .with_target(false)
            .with_filter(if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO });

        tracing_subscriber::registry().with(file).with(console).init();

        Self { path, _flush: flush }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
