//! Progress percentages and in-flight file reporting

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{Client, ClientRegistry};
use crate::file::{FileRegistry, TrackedFile};
use crate::io::FileIo;
use crate::messages::FileProgress;

/// `100 * part / total`, with an empty total counting as complete
#[must_use]
pub fn percent(part: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        (part.min(total) * 100 / total) as u8
    }
}

/// Recomputes the observational counters on files and client files
pub struct ProgressTracker {
    root: PathBuf,
    io: Arc<dyn FileIo>,
    files: Arc<FileRegistry>,
    clients: Arc<ClientRegistry>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(root: PathBuf, io: Arc<dyn FileIo>, files: Arc<FileRegistry>, clients: Arc<ClientRegistry>) -> Self {
        Self {
            root,
            io,
            files,
            clients,
        }
    }

    /// Current on-disk mtime, or the last scanned one if the file cannot be stat'ed
    fn current_mtime(&self, file: &TrackedFile) -> std::time::SystemTime {
        self.io
            .metadata(&self.root.join(file.name()))
            .map_or_else(|_| file.modified(), |info| info.modified)
    }

    /// Refresh every percentage once.
    ///
    /// Digests are judged against the file's mtime on disk, so a touch since
    /// the last scan shows up as stale right away.
    pub fn update(&self) {
        for file in self.files.files() {
            let mtime = self.current_mtime(&file);
            let (total, fast, slow) = file.with_regions(|regions| {
                (
                    regions.len(),
                    regions.values().filter(|r| r.fast_fresh(mtime)).count(),
                    regions.values().filter(|r| r.slow_fresh(mtime)).count(),
                )
            });
            file.status.fast_up_to_date.store(percent(fast, total), Ordering::Relaxed);
            file.status.slow_up_to_date.store(percent(slow, total), Ordering::Relaxed);
        }

        for client in self.clients.clients() {
            self.update_client(&client);
        }
    }

    fn update_client(&self, client: &Client) {
        for entry in &client.files {
            let Some(server) = self.files.get(*entry.key()) else {
                continue;
            };
            let offsets: Vec<u64> = server.with_regions(|r| r.keys().copied().collect());
            let received = entry.with_regions(|regions| {
                offsets
                    .iter()
                    .filter(|o| regions.get(o).is_some_and(|r| r.quick_digest.is_some()))
                    .count()
            });
            entry
                .status
                .metadata_received
                .store(percent(received, offsets.len()), Ordering::Relaxed);
        }
    }

    /// Progress for every file `client` has reported on, sorted by name
    #[must_use]
    pub fn progress(&self, client: &Client) -> Vec<FileProgress> {
        let mut report: Vec<FileProgress> = client
            .files
            .iter()
            .filter_map(|entry| {
                let server = self.files.get(*entry.key())?;
                Some(FileProgress {
                    file_id: server.id(),
                    name: server.name().display().to_string(),
                    synced_percent: entry.status.synced.load(Ordering::Relaxed),
                    metadata_received_percent: entry.status.metadata_received.load(Ordering::Relaxed),
                    fast_up_to_date_percent: server.status.fast_up_to_date.load(Ordering::Relaxed),
                    slow_up_to_date_percent: server.status.slow_up_to_date.load(Ordering::Relaxed),
                })
            })
            .collect();
        report.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }

    /// Names of files with at least one outstanding offer, across all clients
    #[must_use]
    pub fn in_flight_files(&self) -> Vec<String> {
        let ids: BTreeSet<_> = self
            .clients
            .clients()
            .iter()
            .flat_map(|c| c.offered.lock().iter().map(|o| o.file_id).collect::<Vec<_>>())
            .collect();
        let names: BTreeSet<String> = ids
            .into_iter()
            .filter_map(|id| self.files.get(id))
            .map(|f| f.name().display().to_string())
            .collect();
        names.into_iter().collect()
    }

    /// Update every `interval` until cancelled
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => self.update(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TransferCandidate;
    use crate::io::LocalFileIo;
    use crate::region::{ChunkMode, RegionCalculator};
    use std::path::Path;
    use std::time::{Duration, Instant, SystemTime};
    use tempfile::TempDir;

    fn tracker(root: &Path, files: &Arc<FileRegistry>, clients: &Arc<ClientRegistry>) -> ProgressTracker {
        ProgressTracker::new(root.to_path_buf(), Arc::new(LocalFileIo), Arc::clone(files), Arc::clone(clients))
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(5, 3), 100);
    }

    #[test]
    fn test_update_and_report() {
        let calc = RegionCalculator::new(10);
        let mtime = SystemTime::now();
        let files = Arc::new(FileRegistry::new());
        let clients = Arc::new(ClientRegistry::new());

        let (server, _) = files.register(Path::new("b.bin"), 40, mtime);
        server.resize(&calc, 40, ChunkMode::Replace);
        server.update_region(0, 10, |r| r.fast_modified = Some(mtime));
        server.update_region(10, 10, |r| r.fast_modified = Some(mtime));
        server.update_region(0, 10, |r| r.slow_modified = Some(mtime));

        let client = clients.introduce(1, 4);
        let copy = Arc::new(TrackedFile::new(server.id(), "b.bin", 40, mtime));
        copy.resize(&calc, 40, ChunkMode::Replace);
        copy.update_region(30, 10, |r| r.quick_digest = Some(1));
        client.files.insert(server.id(), copy);

        // Nothing on disk: the scanned mtime is used
        let dir = TempDir::new().unwrap();
        let tracker = tracker(dir.path(), &files, &clients);
        tracker.update();

        let progress = tracker.progress(&client);
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].name, "b.bin");
        assert_eq!(progress[0].fast_up_to_date_percent, 50);
        assert_eq!(progress[0].slow_up_to_date_percent, 25);
        assert_eq!(progress[0].metadata_received_percent, 25);
        assert_eq!(progress[0].synced_percent, 0);

        assert!(tracker.in_flight_files().is_empty());
        client.mark_offered(TransferCandidate::new(server.id(), 0, 10), Instant::now());
        assert_eq!(tracker.in_flight_files(), vec!["b.bin".to_string()]);
    }

    #[test]
    fn test_touch_since_last_scan_is_not_up_to_date() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, [1u8; 20]).unwrap();
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();

        let calc = RegionCalculator::new(10);
        let files = Arc::new(FileRegistry::new());
        let clients = Arc::new(ClientRegistry::new());
        let (file, _) = files.register(Path::new("a.bin"), 20, mtime);
        file.resize(&calc, 20, ChunkMode::Replace);
        file.update_all(|r| {
            r.fast_modified = Some(mtime);
            r.slow_modified = Some(mtime);
        });

        let tracker = tracker(dir.path(), &files, &clients);
        tracker.update();
        assert_eq!(file.status.fast_up_to_date.load(Ordering::Relaxed), 100);
        assert_eq!(file.status.slow_up_to_date.load(Ordering::Relaxed), 100);

        let touched = filetime::FileTime::from_system_time(mtime + Duration::from_secs(5));
        filetime::set_file_mtime(&path, touched).unwrap();
        tracker.update();
        assert_eq!(file.status.fast_up_to_date.load(Ordering::Relaxed), 0);
        assert_eq!(file.status.slow_up_to_date.load(Ordering::Relaxed), 0);
    }
}
