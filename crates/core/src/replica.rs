//! Replica: mirrors the server's file list locally and pulls the regions it
//! is missing

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientId;
use crate::config::{ReplicaConfig, SyncConfig};
use crate::error::{Result, StateInconsistency, SyncError};
use crate::fast::FastScanner;
use crate::file::{FileId, FileMetadata, FileRegistry, TrackedFile};
use crate::hash::{SlowDigest, quick_digest, sample_window};
use crate::io::{FileIo, LocalFileIo, run_blocking};
use crate::messages::{ClientRegionReport, FastDigestReport, SlowDigestReport};
use crate::region::{ChunkMode, RegionCalculator};
use crate::service::SyncService;
use crate::slow::SlowScanner;
use crate::stats::Statistics;

/// Totals for one file-list refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub files: usize,
    /// Files created locally as zero bytes
    pub created: usize,
    /// Existing files scanned and reported
    pub rescanned: usize,
    pub digests_reported: usize,
}

pub struct Replica {
    root: PathBuf,
    service: Arc<dyn SyncService>,
    io: Arc<dyn FileIo>,
    config: ReplicaConfig,
    calc: RegionCalculator,
    sample_size: u64,
    fast: Arc<FastScanner>,
    slow: Arc<SlowScanner>,
    stats: Arc<Statistics>,
    files: FileRegistry,
    /// Server size each local file was last scanned and reported at
    reported_sizes: DashMap<FileId, u64>,
    client_id: AtomicI32,
    introducing: Mutex<()>,
    refresh_now: Notify,
    cancel: CancellationToken,
}

impl Replica {
    /// Replica writing to the local filesystem under `root`.
    ///
    /// Region, sample and batch sizes come from `config.engine` and must match
    /// the server's.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, service: Arc<dyn SyncService>, config: &SyncConfig) -> Self {
        Self::with_io(root, service, config, Arc::new(LocalFileIo))
    }

    #[must_use]
    pub fn with_io(
        root: impl Into<PathBuf>,
        service: Arc<dyn SyncService>,
        config: &SyncConfig,
        io: Arc<dyn FileIo>,
    ) -> Self {
        let stats = Arc::new(Statistics::new());
        Self {
            root: root.into(),
            service,
            config: config.replica.clone(),
            calc: RegionCalculator::new(config.engine.region_size),
            sample_size: config.engine.sample_size,
            fast: Arc::new(
                FastScanner::new(Arc::clone(&io), Arc::clone(&stats))
                    .with_sample_size(config.engine.sample_size),
            ),
            slow: Arc::new(
                SlowScanner::new(Arc::clone(&io), Arc::clone(&stats))
                    .with_batch_size(config.engine.batch_size),
            ),
            io,
            stats,
            files: FileRegistry::new(),
            reported_sizes: DashMap::new(),
            client_id: AtomicI32::new(0),
            introducing: Mutex::new(()),
            refresh_now: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Id assigned by the server, 0 before the first introduction
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client_id.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Ask the server for a fresh client id
    ///
    /// # Errors
    /// Returns the transport error if the server cannot be reached
    pub async fn introduce(&self) -> Result<ClientId> {
        let _guard = self.introducing.lock().await;
        self.introduce_locked().await
    }

    async fn introduce_locked(&self) -> Result<ClientId> {
        let id = self.service.introduce().await?;
        self.client_id.store(id, Ordering::Release);
        self.reported_sizes.clear();
        info!("Introduced to server as client {id}");
        Ok(id)
    }

    /// Re-introduce after the server forgot `stale`, unless another task
    /// already did
    async fn reintroduce(&self, stale: ClientId) {
        let _guard = self.introducing.lock().await;
        if self.client_id() != stale {
            return;
        }
        warn!("Server no longer knows client {stale}, introducing again");
        match self.introduce_locked().await {
            Ok(_) => self.refresh_now.notify_one(),
            Err(e) => warn!("Re-introduction failed: {e}"),
        }
    }

    async fn handle_error(&self, context: &str, err: SyncError) {
        match err.unknown_client() {
            Some(stale) => self.reintroduce(stale).await,
            None => warn!("{context}: {err}"),
        }
    }

    /// Introduce, then spawn the refresh loop and the puller workers
    ///
    /// # Errors
    /// Returns the error of the initial introduction
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>> {
        self.introduce().await?;

        let mut handles = vec![tokio::spawn(Arc::clone(self).run_refresh())];
        for worker in 0..self.config.workers.max(1) {
            handles.push(tokio::spawn(Arc::clone(self).run_worker(worker)));
        }
        Ok(handles)
    }

    pub fn shutdown(&self) {
        info!("Shutting down replica for {}", self.root.display());
        self.cancel.cancel();
    }

    /// Mirror the server's file list once.
    ///
    /// # Errors
    /// Returns transport errors, and `UnknownClient` if the server has
    /// evicted this replica
    pub async fn refresh(&self) -> Result<RefreshReport> {
        let listed = self.service.list_files().await?;
        let mut report = RefreshReport {
            files: listed.len(),
            ..RefreshReport::default()
        };

        for meta in listed {
            match self.prepare_file(&meta, &mut report).await {
                Ok(()) => {}
                Err(e) if e.unknown_client().is_some() => return Err(e),
                Err(e) => warn!("Unable to prepare [{}]: {e}", meta.name.display()),
            }
        }
        Ok(report)
    }

    async fn prepare_file(&self, meta: &FileMetadata, report: &mut RefreshReport) -> Result<()> {
        if !meta.name.components().all(|c| matches!(c, Component::Normal(_))) {
            warn!("Ignoring server file with unsafe name [{}]", meta.name.display());
            return Ok(());
        }

        let (local, created) = self.files.insert_with_id(meta);
        let mode = if created { ChunkMode::Replace } else { ChunkMode::Merge };
        local.resize(&self.calc, meta.size, mode);

        let path = self.root.join(&meta.name);
        let client_id = self.client_id();
        let exists = self.io.metadata(&path).is_ok();

        let io = Arc::clone(&self.io);
        let size = meta.size;
        let target = path.clone();
        run_blocking(path.clone(), move || io.set_len(&target, size)).await?;

        if !exists {
            debug!("Created blank [{}] ({size} bytes)", meta.name.display());
            self.service.report_blank_file(client_id, meta.id).await?;
            self.reported_sizes.insert(meta.id, size);
            report.created += 1;
            return Ok(());
        }

        if self.reported_sizes.get(&meta.id).is_some_and(|s| *s == size) {
            return Ok(());
        }

        let count = self.scan_and_report(client_id, &local, path).await?;
        self.reported_sizes.insert(meta.id, size);
        report.rescanned += 1;
        report.digests_reported += count;
        Ok(())
    }

    /// Fast and slow scan a local file and report every digest it has
    async fn scan_and_report(&self, client_id: ClientId, local: &Arc<TrackedFile>, path: PathBuf) -> Result<usize> {
        let file = Arc::clone(local);
        let fast = Arc::clone(&self.fast);
        let slow = Arc::clone(&self.slow);
        let target = path.clone();
        run_blocking(path, move || {
            fast.scan(&file, &target)?;
            slow.scan(&file, &target)?;
            Ok(())
        })
        .await?;

        let regions = local.regions();
        let fast_batch: Vec<FastDigestReport> = regions
            .iter()
            .filter_map(|r| {
                Some(FastDigestReport {
                    client_id,
                    file_id: local.id(),
                    offset: r.offset,
                    quick_digest: r.quick_digest?,
                })
            })
            .collect();
        let slow_batch: Vec<SlowDigestReport> = regions
            .iter()
            .filter_map(|r| {
                Some(SlowDigestReport {
                    client_id,
                    file_id: local.id(),
                    offset: r.offset,
                    slow_digest: r.slow_digest?,
                })
            })
            .collect();

        let batch_size = self.config.digest_batch_size.max(1);
        for chunk in fast_batch.chunks(batch_size) {
            self.service.report_fast_digests(chunk.to_vec()).await?;
        }
        for chunk in slow_batch.chunks(batch_size) {
            self.service.report_slow_digests(chunk.to_vec()).await?;
        }
        debug!(
            "Reported {} fast and {} slow digests for [{}]",
            fast_batch.len(),
            slow_batch.len(),
            local.name().display()
        );
        Ok(fast_batch.len() + slow_batch.len())
    }

    /// Pull, write and report one region.
    /// Returns false if the server had nothing to transfer.
    ///
    /// # Errors
    /// Returns transport, I/O and state errors for this unit of work
    pub async fn pull_once(&self) -> Result<bool> {
        let client_id = self.client_id();
        let Some(payload) = self
            .service
            .poll_transfer_candidate(client_id, self.config.poll_timeout())
            .await?
        else {
            return Ok(false);
        };

        let local = self
            .files
            .get(payload.file_id)
            .ok_or(StateInconsistency::UnknownFile(payload.file_id))?;
        let path = self.root.join(local.name());

        let io = Arc::clone(&self.io);
        let target = path.clone();
        let data = payload.data.clone();
        let offset = payload.offset;
        run_blocking(path, move || io.write_range(&target, offset, &data)).await?;
        self.stats.add_transferred(payload.data.len() as u64);

        let len = payload.data.len() as u64;
        let (start, sample_len) = sample_window(0, len, self.sample_size);
        let sample = &payload.data[start as usize..(start + sample_len) as usize];

        self.service
            .report_client_region(ClientRegionReport {
                client_id,
                file_id: payload.file_id,
                offset: payload.offset,
                size: payload.size,
                quick_digest: Some(quick_digest(sample)),
                slow_digest: Some(SlowDigest::from_bytes(&payload.data)),
            })
            .await?;
        debug!(
            "Wrote [{}] offset {} ({len} bytes)",
            local.name().display(),
            payload.offset
        );
        Ok(true)
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!("puller worker {worker} started");
        loop {
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => break,
                outcome = self.pull_once() => outcome,
            };
            let pause = match outcome {
                Ok(true) => continue,
                Ok(false) => self.config.idle_backoff(),
                Err(e) => {
                    self.handle_error("Transfer failed", e).await;
                    self.config.idle_backoff()
                }
            };
            if self.sleep(pause).await {
                break;
            }
        }
        debug!("puller worker {worker} stopped");
    }

    async fn run_refresh(self: Arc<Self>) {
        loop {
            let outcome = tokio::select! {
                () = self.cancel.cancelled() => break,
                outcome = self.refresh() => outcome,
            };
            match outcome {
                Ok(report) if report.created + report.rescanned > 0 => info!(
                    "Refreshed {} files: {} created, {} rescanned",
                    report.files, report.created, report.rescanned
                ),
                Ok(_) => {}
                Err(e) => self.handle_error("File list refresh failed", e).await,
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.refresh_now.notified() => {}
                () = tokio::time::sleep(self.config.refresh_interval()) => {}
            }
        }
        debug!("refresh loop stopped");
    }

    /// Sleep unless cancelled first. Returns true if cancelled.
    async fn sleep(&self, pause: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(pause) => false,
        }
    }
}
