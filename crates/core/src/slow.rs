//! Slow scanner: SHA-256 per region, read in batches

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::fast::ScanReport;
use crate::file::TrackedFile;
use crate::hash::SlowDigest;
use crate::io::FileIo;
use crate::stats::Statistics;

/// Default number of consecutive regions covered by one read
pub const BATCH_SIZE: usize = 32;

/// Recomputes slow digests, one read per batch of consecutive regions
pub struct SlowScanner {
    io: Arc<dyn FileIo>,
    stats: Arc<Statistics>,
    batch_size: usize,
}

impl SlowScanner {
    #[must_use]
    pub fn new(io: Arc<dyn FileIo>, stats: Arc<Statistics>) -> Self {
        Self {
            io,
            stats,
            batch_size: BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Scan `file` batch by batch.
    ///
    /// A batch is skipped only when every region in it is fresh; otherwise
    /// the whole batch is read and every region in it is rehashed.
    ///
    /// # Errors
    /// Returns an I/O error if the file cannot be stat'ed or read
    pub fn scan(&self, file: &TrackedFile, path: &Path) -> Result<ScanReport<SlowDigest>> {
        let regions = file.regions();
        let mut report = ScanReport::default();

        for batch in regions.chunks(self.batch_size) {
            let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
                continue;
            };

            let mtime = self.io.metadata(path)?.modified;
            if batch.iter().all(|r| r.slow_fresh(mtime)) {
                report.skipped += batch.len();
                continue;
            }

            let start = first.offset;
            let buf = self.io.read_range(path, start, last.end() - start)?;
            let len = buf.len() as u64;
            self.stats.add_slow_read(len);
            report.bytes_read += len;

            for region in batch {
                let from = (region.offset - start) as usize;
                let digest = SlowDigest::from_bytes(&buf[from..from + region.size as usize]);
                report.read += 1;

                let stored = file.update_region(region.offset, region.size, |r| {
                    r.slow_digest = Some(digest);
                    r.slow_modified = Some(mtime);
                });
                if stored {
                    report.updated.push((region.offset, digest));
                } else {
                    debug!(file = %file.name().display(), offset = region.offset, "region re-chunked during slow scan");
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::testing::CountingIo;
    use crate::region::{ChunkMode, RegionCalculator};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn setup(content: &[u8], region_size: u64) -> (TempDir, TrackedFile) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.bin"), content).unwrap();
        let file = TrackedFile::new(1, "f.bin", content.len() as u64, SystemTime::now());
        file.resize(&RegionCalculator::new(region_size), content.len() as u64, ChunkMode::Replace);
        (dir, file)
    }

    #[test]
    fn test_digests_match_region_bytes() {
        let content: Vec<u8> = (0..25u8).collect();
        let (dir, file) = setup(&content, 10);
        let io = Arc::new(CountingIo::default());
        let scanner = SlowScanner::new(io.clone(), Arc::new(Statistics::new())).with_batch_size(2);

        let report = scanner.scan(&file, &dir.path().join("f.bin")).unwrap();
        // Two batches: [0, 10] and [20]
        assert_eq!(io.reads(), 2);
        assert_eq!(report.read, 3);
        assert_eq!(report.bytes_read, 25);
        assert_eq!(
            file.region(10).unwrap().slow_digest,
            Some(SlowDigest::from_bytes(&content[10..20]))
        );
        assert_eq!(
            file.region(20).unwrap().slow_digest,
            Some(SlowDigest::from_bytes(&content[20..25]))
        );
    }

    #[test]
    fn test_fresh_batch_is_skipped() {
        let (dir, file) = setup(&[7u8; 40], 10);
        let path = dir.path().join("f.bin");
        let io = Arc::new(CountingIo::default());
        let stats = Arc::new(Statistics::new());
        let scanner = SlowScanner::new(io.clone(), stats.clone()).with_batch_size(2);

        scanner.scan(&file, &path).unwrap();
        assert_eq!(io.reads(), 2);

        let report = scanner.scan(&file, &path).unwrap();
        assert_eq!(io.reads(), 2);
        assert_eq!(report.skipped, 4);
        assert_eq!(stats.snapshot().bytes_read_slow, 40);
    }

    #[test]
    fn test_one_stale_region_rereads_its_batch() {
        let (dir, file) = setup(&[7u8; 40], 10);
        let path = dir.path().join("f.bin");
        let io = Arc::new(CountingIo::default());
        let scanner = SlowScanner::new(io.clone(), Arc::new(Statistics::new())).with_batch_size(2);
        scanner.scan(&file, &path).unwrap();

        // Make the first region of the second batch stale
        file.update_region(20, 10, |r| r.slow_modified = Some(SystemTime::UNIX_EPOCH));

        let report = scanner.scan(&file, &path).unwrap();
        assert_eq!(io.reads(), 3);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.read, 2);
        assert_eq!(
            report.updated.iter().map(|(o, _)| *o).collect::<Vec<_>>(),
            vec![20, 30]
        );
    }

    #[test]
    fn test_touch_rereads_all_batches() {
        let (dir, file) = setup(&[7u8; 40], 10);
        let path = dir.path().join("f.bin");
        let io = Arc::new(CountingIo::default());
        let scanner = SlowScanner::new(io.clone(), Arc::new(Statistics::new())).with_batch_size(3);
        scanner.scan(&file, &path).unwrap();

        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        let touched = filetime::FileTime::from_system_time(mtime + Duration::from_secs(5));
        filetime::set_file_mtime(&path, touched).unwrap();

        let report = scanner.scan(&file, &path).unwrap();
        assert_eq!(report.skipped, 0);
        assert_eq!(report.read, 4);
        assert_eq!(io.reads(), 4);
    }

    #[test]
    fn test_empty_file_reports_nothing() {
        let (dir, file) = setup(&[], 10);
        let io = Arc::new(CountingIo::default());
        let scanner = SlowScanner::new(io.clone(), Arc::new(Statistics::new()));

        let report = scanner.scan(&file, &dir.path().join("f.bin")).unwrap();
        assert_eq!(report, ScanReport::default());
        assert_eq!(io.reads(), 0);
    }
}
