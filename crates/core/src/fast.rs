//! Fast scanner: sampled tail checksum per region

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::file::TrackedFile;
use crate::hash::{QuickDigest, SAMPLE_SIZE, quick_digest, sample_window};
use crate::io::FileIo;
use crate::stats::Statistics;

/// Outcome of scanning one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport<D> {
    /// Regions whose bytes were read
    pub read: usize,
    /// Regions skipped because their digest was still fresh
    pub skipped: usize,
    pub bytes_read: u64,
    /// `(offset, digest)` for every region updated by this scan
    pub updated: Vec<(u64, D)>,
}

impl<D> Default for ScanReport<D> {
    fn default() -> Self {
        Self {
            read: 0,
            skipped: 0,
            bytes_read: 0,
            updated: Vec::new(),
        }
    }
}

/// Recomputes quick digests from the last `sample_size` bytes of each region
pub struct FastScanner {
    io: Arc<dyn FileIo>,
    stats: Arc<Statistics>,
    sample_size: u64,
}

impl FastScanner {
    #[must_use]
    pub fn new(io: Arc<dyn FileIo>, stats: Arc<Statistics>) -> Self {
        Self {
            io,
            stats,
            sample_size: SAMPLE_SIZE,
        }
    }

    #[must_use]
    pub fn with_sample_size(mut self, sample_size: u64) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    /// Scan every stale region of `file`, stored on disk at `path`.
    ///
    /// The mtime is observed once up front and stamped on every region this
    /// pass computes.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be stat'ed or read
    pub fn scan(&self, file: &TrackedFile, path: &Path) -> Result<ScanReport<QuickDigest>> {
        let mtime = self.io.metadata(path)?.modified;
        let mut report = ScanReport::default();

        for region in file.regions() {
            if region.fast_fresh(mtime) {
                report.skipped += 1;
                continue;
            }

            let (start, len) = sample_window(region.offset, region.size, self.sample_size);
            let sample = self.io.read_range(path, start, len)?;
            let digest = quick_digest(&sample);
            self.stats.add_fast_read(len);
            report.read += 1;
            report.bytes_read += len;

            let stored = file.update_region(region.offset, region.size, |r| {
                r.quick_digest = Some(digest);
                r.fast_modified = Some(mtime);
            });
            if stored {
                report.updated.push((region.offset, digest));
            } else {
                debug!(file = %file.name().display(), offset = region.offset, "region re-chunked during fast scan");
            }
        }

        Ok(report)
    }
}
