//! Directory scanner: discovery plus the repeating fast/slow scan loops

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::fast::FastScanner;
use crate::file::{FileRegistry, TrackedFile};
use crate::io::FileIo;
use crate::region::{ChunkMode, RegionCalculator};
use crate::scan::Scanner;
use crate::slow::SlowScanner;
use crate::stats::format_rate;

/// Which digest a scan loop maintains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Fast,
    Slow,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fast => write!(f, "fast"),
            Self::Slow => write!(f, "slow"),
        }
    }
}

/// Totals for one pass over every tracked file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub files_scanned: usize,
    pub files_missing: usize,
    pub files_failed: usize,
    pub regions_read: usize,
    pub bytes_read: u64,
}

/// Registers files found under a root and keeps their digests current
pub struct DirectoryScanner {
    root: PathBuf,
    walker: Scanner,
    files: Arc<FileRegistry>,
    io: Arc<dyn FileIo>,
    calc: RegionCalculator,
    fast: FastScanner,
    slow: SlowScanner,
}

impl DirectoryScanner {
    #[must_use]
    pub fn new(
        walker: Scanner,
        files: Arc<FileRegistry>,
        io: Arc<dyn FileIo>,
        calc: RegionCalculator,
        fast: FastScanner,
        slow: SlowScanner,
    ) -> Self {
        Self {
            root: walker.root().to_path_buf(),
            walker,
            files,
            io,
            calc,
            fast,
            slow,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Track every regular file under the root that is not tracked yet.
    /// Returns how many were added.
    pub fn discover(&self) -> usize {
        let paths = match self.walker.list_regular_files() {
            Ok(paths) => paths,
            Err(e) => {
                error!("Error while scanning directory {}: {e}", self.root.display());
                return 0;
            }
        };

        let mut added = 0;
        for name in paths {
            if self.files.get_by_name(&name).is_some() {
                continue;
            }
            let info = match self.io.metadata(&self.root.join(&name)) {
                Ok(info) => info,
                Err(e) => {
                    debug!("not tracking {}: {e}", name.display());
                    continue;
                }
            };

            let (file, created) = self.files.register(&name, info.size, info.modified);
            if created {
                file.resize(&self.calc, info.size, ChunkMode::Replace);
                debug!("Added new tracked file {}:[{}]", file.id(), name.display());
                added += 1;
            }
        }
        added
    }

    /// Bring one file's layout in line with disk, then scan it.
    /// Returns `(regions_read, bytes_read)`.
    ///
    /// # Errors
    /// Returns an I/O error if the file is gone or unreadable
    pub fn process_file(&self, file: &TrackedFile, mode: ScanMode) -> Result<(usize, u64)> {
        let path = self.root.join(file.name());
        let info = self.io.metadata(&path)?;

        if info.size != file.size() || file.region_count() as u64 != self.calc.region_count(info.size) {
            debug!("Recalculating regions for [{}]", file.name().display());
            file.resize(&self.calc, info.size, ChunkMode::Merge);
        }
        file.set_modified(info.modified);

        let started = Instant::now();
        let (read, bytes) = match mode {
            ScanMode::Fast => {
                let report = self.fast.scan(file, &path)?;
                (report.read, report.bytes_read)
            }
            ScanMode::Slow => {
                let report = self.slow.scan(file, &path)?;
                (report.read, report.bytes_read)
            }
        };
        if read > 0 {
            debug!(
                "Finished {mode} scan for [{}]: {read} regions in {:?}",
                file.name().display(),
                started.elapsed()
            );
        }
        Ok((read, bytes))
    }

    /// Discover new files, then scan all of them, most recently modified first.
    ///
    /// Per-file failures are logged and do not stop the pass.
    pub fn scan_cycle(&self, mode: ScanMode) -> CycleReport {
        self.discover();

        let mut files: Vec<_> = self
            .files
            .files()
            .into_iter()
            .map(|f| {
                let mtime = self
                    .io
                    .metadata(&self.root.join(f.name()))
                    .map_or_else(|_| f.modified(), |info| info.modified);
                (mtime, f)
            })
            .collect();
        files.sort_by(|(a, _), (b, _)| b.cmp(a));

        let mut report = CycleReport::default();
        for (_, file) in files {
            match self.process_file(&file, mode) {
                Ok((read, bytes)) => {
                    report.files_scanned += 1;
                    report.regions_read += read;
                    report.bytes_read += bytes;
                }
                Err(e) if e.is_not_found() => {
                    debug!("skipping vanished file [{}]", file.name().display());
                    report.files_missing += 1;
                }
                Err(e) => {
                    warn!("Unable to scan file [{}]: {e}", file.name().display());
                    report.files_failed += 1;
                }
            }
        }
        report
    }

    /// Run [`DirectoryScanner::scan_cycle`] every `interval` until cancelled
    pub async fn run(self: Arc<Self>, mode: ScanMode, interval: Duration, cancel: CancellationToken) {
        let mut cycle = 0u64;
        while !cancel.is_cancelled() {
            cycle += 1;
            let started = Instant::now();
            let scanner = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || scanner.scan_cycle(mode)).await {
                Ok(report) => {
                    let elapsed = started.elapsed();
                    info!(
                        "Finished [{cycle}] {mode} scan of {} files in {:.2}s at {}",
                        report.files_scanned,
                        elapsed.as_secs_f64(),
                        format_rate(report.bytes_read, elapsed)
                    );
                }
                Err(e) => error!("{mode} scan cycle {cycle} panicked: {e}"),
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        debug!("{mode} scan loop stopped");
    }
}
