//! Server engine: owns the file and client state and runs the background loops

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientId, ClientRegistry};
use crate::config::{EngineConfig, SyncConfig};
use crate::directory::{CycleReport, DirectoryScanner, ScanMode};
use crate::error::{Result, StateInconsistency};
use crate::fast::FastScanner;
use crate::file::{FileId, FileMetadata, FileRegistry, TrackedFile};
use crate::finder::{CandidateFinder, FinderReport};
use crate::hash::SlowDigest;
use crate::io::{FileIo, LocalFileIo, run_blocking};
use crate::messages::{
    ClientRegionReport, FastDigestReport, FileProgress, RegionPayload, SlowDigestReport,
};
use crate::region::{ChunkMode, Region, RegionCalculator};
use crate::scan::Scanner;
use crate::service::SyncService;
use crate::slow::SlowScanner;
use crate::stats::Statistics;
use crate::status::ProgressTracker;

/// One synced root on the server side.
///
/// Construct it, call [`SyncEngine::start`] to spawn the scan, finder,
/// progress, statistics and reaper loops, and hand it to a transport.
pub struct SyncEngine {
    root: PathBuf,
    config: EngineConfig,
    calc: RegionCalculator,
    files: Arc<FileRegistry>,
    clients: Arc<ClientRegistry>,
    io: Arc<dyn FileIo>,
    stats: Arc<Statistics>,
    scanner: Arc<DirectoryScanner>,
    finder: Arc<CandidateFinder>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

impl SyncEngine {
    /// Engine over the local filesystem
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: &SyncConfig) -> Self {
        Self::with_io(root, config, Arc::new(LocalFileIo))
    }

    #[must_use]
    pub fn with_io(root: impl Into<PathBuf>, config: &SyncConfig, io: Arc<dyn FileIo>) -> Self {
        let root = root.into();
        let engine = config.engine.clone();
        let calc = RegionCalculator::new(engine.region_size);
        let files = Arc::new(FileRegistry::new());
        let clients = Arc::new(ClientRegistry::new());
        let stats = Arc::new(Statistics::new());

        let mut walker = Scanner::new(&root).respect_gitignore(config.respect_gitignore);
        for pattern in &config.exclude {
            walker = walker.exclude(pattern.clone());
        }

        let scanner = Arc::new(DirectoryScanner::new(
            walker,
            Arc::clone(&files),
            Arc::clone(&io),
            calc,
            FastScanner::new(Arc::clone(&io), Arc::clone(&stats)).with_sample_size(engine.sample_size),
            SlowScanner::new(Arc::clone(&io), Arc::clone(&stats)).with_batch_size(engine.batch_size),
        ));
        let finder = Arc::new(CandidateFinder::new(
            Arc::clone(&files),
            Arc::clone(&clients),
            calc,
            Arc::clone(&stats),
            engine.offer_expiry(),
        ));
        let tracker = Arc::new(ProgressTracker::new(
            root.clone(),
            Arc::clone(&io),
            Arc::clone(&files),
            Arc::clone(&clients),
        ));

        Self {
            root,
            config: engine,
            calc,
            files,
            clients,
            io,
            stats,
            scanner,
            finder,
            tracker,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn files(&self) -> &Arc<FileRegistry> {
        &self.files
    }

    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Token cancelled by [`SyncEngine::shutdown`]
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn every background loop. Await the handles after
    /// [`SyncEngine::shutdown`] to wait for them to stop.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        info!("Starting engine for {}", self.root.display());
        let cancel = &self.cancel;
        vec![
            tokio::spawn(Arc::clone(&self.scanner).run(
                ScanMode::Fast,
                self.config.fast_scan_interval(),
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.scanner).run(
                ScanMode::Slow,
                self.config.slow_scan_interval(),
                cancel.clone(),
            )),
            tokio::spawn(Arc::clone(&self.finder).run(self.config.finder_interval(), cancel.clone())),
            tokio::spawn(Arc::clone(&self.tracker).run(self.config.progress_interval(), cancel.clone())),
            tokio::spawn(Arc::clone(&self.stats).run_reporter(self.config.stats_interval(), cancel.clone())),
            tokio::spawn(Arc::clone(self).run_reaper(cancel.clone())),
        ]
    }

    /// Stop every loop and release anything blocked on a client queue
    pub fn shutdown(&self) {
        info!("Shutting down engine for {}", self.root.display());
        self.cancel.cancel();
        for client in self.clients.clients() {
            client.queue.close();
        }
    }

    /// One discovery + scan pass, outside the background loops
    pub async fn run_scan_cycle(&self, mode: ScanMode) -> CycleReport {
        let scanner = Arc::clone(&self.scanner);
        match tokio::task::spawn_blocking(move || scanner.scan_cycle(mode)).await {
            Ok(report) => report,
            Err(e) => {
                warn!("{mode} scan cycle failed: {e}");
                CycleReport::default()
            }
        }
    }

    /// One candidate finder pass, outside the background loops
    pub async fn run_finder_cycle(&self) -> FinderReport {
        self.finder.cycle().await
    }

    /// Recompute progress percentages now
    pub fn update_progress(&self) {
        self.tracker.update();
    }

    /// Names of files with outstanding offers
    #[must_use]
    pub fn in_flight_files(&self) -> Vec<String> {
        self.tracker.in_flight_files()
    }

    /// Drop clients idle for longer than the configured timeout.
    /// Returns how many were evicted.
    pub fn reap_idle_clients(&self) -> usize {
        let timeout = self.config.client_idle_timeout();
        let now = Instant::now();
        let mut evicted = 0;
        for client in self.clients.clients() {
            let idle = client.idle_for(now);
            if idle > timeout && self.clients.remove(client.id()).is_some() {
                info!("Evicted client {} after {}s idle", client.id(), idle.as_secs());
                evicted += 1;
            }
        }
        evicted
    }

    async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let period = (self.config.client_idle_timeout() / 4).max(Duration::from_millis(10));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(period) => {
                    self.reap_idle_clients();
                }
            }
        }
    }

    fn client(&self, id: ClientId) -> Result<Arc<Client>> {
        let client = self
            .clients
            .get(id)
            .ok_or(StateInconsistency::UnknownClient(id))?;
        client.touch();
        Ok(client)
    }

    /// The client's copy of a server file, created on first report and kept
    /// on the server's layout
    fn client_file(&self, client: &Client, file_id: FileId) -> Result<(Arc<TrackedFile>, Arc<TrackedFile>)> {
        let server = self
            .files
            .get(file_id)
            .ok_or(StateInconsistency::UnknownFile(file_id))?;
        let copy = Arc::clone(
            client
                .files
                .entry(file_id)
                .or_insert_with(|| {
                    let meta = server.metadata();
                    let copy = TrackedFile::new(meta.id, meta.name, meta.size, meta.modified);
                    copy.resize(&self.calc, meta.size, ChunkMode::Replace);
                    Arc::new(copy)
                })
                .value(),
        );
        if copy.size() != server.size() {
            copy.resize(&self.calc, server.size(), ChunkMode::Merge);
        }
        Ok((server, copy))
    }

    fn note_confirmation(&self, client: &Client, file: &TrackedFile, offset: u64) {
        if !client.confirm(file.id(), offset) {
            return;
        }
        let count = client.count_confirmation(file.id(), offset);
        debug!(
            "Client {} confirmed [{}] offset {offset} ({count} times)",
            client.id(),
            file.name().display()
        );
        if count == self.config.divergence_warn_threshold.saturating_add(1) {
            warn!(
                "Client {} keeps diverging on [{}] offset {offset}: transferred {count} times",
                client.id(),
                file.name().display()
            );
        }
    }

    /// Apply one batch entry, dropping it with a warning if it refers to
    /// state that does not exist. Unknown clients are returned as errors so
    /// the caller can re-introduce itself.
    fn apply_batch_entry(
        &self,
        client_id: ClientId,
        file_id: FileId,
        offset: u64,
        apply: impl FnOnce(&mut Region),
    ) -> Result<()> {
        let client = self.client(client_id)?;
        let result = self.client_file(&client, file_id).and_then(|(_, copy)| {
            if copy.update_at(offset, apply) {
                Ok(())
            } else {
                Err(StateInconsistency::RegionMismatch { file_id, offset }.into())
            }
        });
        if let Err(e) = result {
            warn!("Dropping digest report from client {client_id}: {e}");
        }
        Ok(())
    }
}

#[async_trait]
impl SyncService for SyncEngine {
    async fn introduce(&self) -> Result<ClientId> {
        let client = self
            .clients
            .introduce(self.config.queue_min_shrink, self.config.queue_max_grow);
        info!("Introduced client {}", client.id());
        Ok(client.id())
    }

    async fn list_files(&self) -> Result<Vec<FileMetadata>> {
        let files = self.files.files();
        let io = Arc::clone(&self.io);
        let root = self.root.clone();
        run_blocking(self.root.clone(), move || {
            let mut listed: Vec<FileMetadata> = files
                .iter()
                .filter(|f| io.metadata(&root.join(f.name())).is_ok())
                .map(|f| f.metadata())
                .collect();
            listed.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name.cmp(&b.name)));
            Ok(listed)
        })
        .await
    }

    async fn report_client_region(&self, report: ClientRegionReport) -> Result<()> {
        let client = self.client(report.client_id)?;
        let (server, copy) = self.client_file(&client, report.file_id)?;

        let stored = copy.update_region(report.offset, report.size, |r| {
            if let Some(quick) = report.quick_digest {
                r.quick_digest = Some(quick);
            }
            if let Some(slow) = report.slow_digest {
                r.slow_digest = Some(slow);
            }
        });
        self.note_confirmation(&client, &server, report.offset);

        if stored {
            Ok(())
        } else {
            Err(StateInconsistency::RegionMismatch {
                file_id: report.file_id,
                offset: report.offset,
            }
            .into())
        }
    }

    async fn report_fast_digests(&self, batch: Vec<FastDigestReport>) -> Result<()> {
        for entry in batch {
            self.apply_batch_entry(entry.client_id, entry.file_id, entry.offset, |r| {
                r.quick_digest = Some(entry.quick_digest);
            })?;
        }
        Ok(())
    }

    async fn report_slow_digests(&self, batch: Vec<SlowDigestReport>) -> Result<()> {
        for entry in batch {
            self.apply_batch_entry(entry.client_id, entry.file_id, entry.offset, |r| {
                r.slow_digest = Some(entry.slow_digest);
            })?;
        }
        Ok(())
    }

    async fn report_blank_file(&self, client_id: ClientId, file_id: FileId) -> Result<()> {
        let client = self.client(client_id)?;
        let (server, copy) = self.client_file(&client, file_id)?;

        // Full regions share one size, so only a couple of digests are ever computed
        let mut zeroed: HashMap<u64, SlowDigest> = HashMap::new();
        copy.update_all(|r| {
            let size = r.size;
            let digest = *zeroed.entry(size).or_insert_with(|| SlowDigest::zeroed(size));
            r.quick_digest = Some(0);
            r.slow_digest = Some(digest);
        });
        debug!(
            "Client {client_id} created blank [{}] with {} regions",
            server.name().display(),
            copy.region_count()
        );
        Ok(())
    }

    async fn poll_transfer_candidate(
        &self,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Option<RegionPayload>> {
        let client = self.client(client_id)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(candidate) = client.queue.poll(remaining).await else {
                return Ok(None);
            };
            client.mark_offered(candidate, Instant::now());

            let Some(file) = self.files.get(candidate.file_id) else {
                client.confirm(candidate.file_id, candidate.offset);
                continue;
            };

            let path = self.root.join(file.name());
            let io = Arc::clone(&self.io);
            let read_path = path.clone();
            let read = run_blocking(path, move || {
                io.read_range(&read_path, candidate.offset, candidate.size)
            })
            .await;

            match read {
                Ok(data) => {
                    self.stats.add_transferred(candidate.size);
                    debug!(
                        "Offering [{}] offset {} ({} bytes) to client {client_id}",
                        file.name().display(),
                        candidate.offset,
                        candidate.size
                    );
                    return Ok(Some(RegionPayload {
                        file_id: candidate.file_id,
                        offset: candidate.offset,
                        size: candidate.size,
                        data: Bytes::from(data),
                    }));
                }
                Err(e) => {
                    // The finder will queue it again once the layout settles
                    warn!("Unable to read candidate for client {client_id}: {e}");
                    client.confirm(candidate.file_id, candidate.offset);
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn progress(&self, client_id: ClientId) -> Result<Vec<FileProgress>> {
        let client = self.client(client_id)?;
        Ok(self.tracker.progress(&client))
    }
}
