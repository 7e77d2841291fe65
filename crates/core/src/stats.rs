//! Byte and event counters owned by one engine instance

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Human-readable rate, e.g. `12.5 MiB/s`
#[must_use]
pub fn format_rate(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let per_sec = if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        bytes
    };
    format!("{}/s", humansize::format_size(per_sec, humansize::BINARY))
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_read_fast: u64,
    pub bytes_read_slow: u64,
    pub bytes_transferred: u64,
    pub collisions: u64,
}

/// Process-local counters, shared by scanners, the finder and the poll path
#[derive(Debug)]
pub struct Statistics {
    bytes_read_fast: AtomicU64,
    bytes_read_slow: AtomicU64,
    bytes_transferred: AtomicU64,
    collisions: AtomicU64,
    last_report: Mutex<(Instant, StatsSnapshot)>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            bytes_read_fast: AtomicU64::new(0),
            bytes_read_slow: AtomicU64::new(0),
            bytes_transferred: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            last_report: Mutex::new((Instant::now(), StatsSnapshot::default())),
        }
    }
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fast_read(&self, bytes: u64) {
        self.bytes_read_fast.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_slow_read(&self, bytes: u64) {
        self.bytes_read_slow.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_transferred(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_read_fast: self.bytes_read_fast.load(Ordering::Relaxed),
            bytes_read_slow: self.bytes_read_slow.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            collisions: self.collisions.load(Ordering::Relaxed),
        }
    }

    /// Log totals and the rate since the previous report
    pub fn report(&self) {
        let now = Instant::now();
        let current = self.snapshot();
        let (elapsed, previous) = {
            let mut last = self.last_report.lock();
            let elapsed = now.saturating_duration_since(last.0);
            let previous = last.1;
            *last = (now, current);
            (elapsed, previous)
        };

        for (name, total, before) in [
            ("read (fast)", current.bytes_read_fast, previous.bytes_read_fast),
            ("read (slow)", current.bytes_read_slow, previous.bytes_read_slow),
            ("transferred", current.bytes_transferred, previous.bytes_transferred),
        ] {
            info!(
                "Bytes {name}: {} total, {}",
                humansize::format_size(total, humansize::BINARY),
                format_rate(total - before, elapsed)
            );
        }
        info!(
            "Collisions: {} total, {} since last report",
            current.collisions,
            current.collisions - previous.collisions
        );
    }

    /// Report every `interval` until cancelled
    pub async fn run_reporter(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => self.report(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Statistics::new();
        stats.add_fast_read(10);
        stats.add_fast_read(5);
        stats.add_slow_read(100);
        stats.add_transferred(7);
        stats.add_collision();

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                bytes_read_fast: 15,
                bytes_read_slow: 100,
                bytes_transferred: 7,
                collisions: 1,
            }
        );
        stats.report();
        assert_eq!(stats.snapshot().bytes_read_fast, 15);
    }

    #[test]
    fn test_format_rate() {
        let rate = format_rate(2048, Duration::from_secs(2));
        assert!(rate.starts_with('1') && rate.ends_with("KiB/s"), "{rate}");
        assert!(format_rate(0, Duration::from_secs(1)).ends_with("B/s"));
    }
}
