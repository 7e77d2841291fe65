//! Candidate finder: compares server regions against each client's
//! reported regions and queues the ones the client needs

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::{Client, ClientRegistry, TransferCandidate};
use crate::file::{FileId, FileRegistry, TrackedFile};
use crate::region::{ChunkMode, Region, RegionCalculator};
use crate::stats::Statistics;
use crate::status::percent;

/// Verdict for one `(client, file, region)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionDecision {
    /// Digests agree
    InSync,
    /// A quick digest is missing on either side
    Undecided,
    /// The client needs this region. `collision` is set when the quick
    /// digests matched but the slow digests did not.
    Transfer { collision: bool },
}

/// Compare a server region with the client's copy of it
#[must_use]
pub fn decide(server: &Region, client: Option<&Region>) -> RegionDecision {
    let Some(client) = client else {
        return RegionDecision::Undecided;
    };
    let (Some(server_quick), Some(client_quick)) = (server.quick_digest, client.quick_digest) else {
        return RegionDecision::Undecided;
    };

    if server_quick != client_quick {
        return RegionDecision::Transfer { collision: false };
    }
    match (&server.slow_digest, &client.slow_digest) {
        (Some(a), Some(b)) if a != b => RegionDecision::Transfer { collision: true },
        _ => RegionDecision::InSync,
    }
}

/// Totals for one finder pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinderReport {
    pub enqueued: usize,
    pub already_pending: usize,
    pub collisions: usize,
    pub undecided: usize,
    /// Offers dropped because they were never confirmed in time
    pub expired: usize,
}

pub struct CandidateFinder {
    files: Arc<FileRegistry>,
    clients: Arc<ClientRegistry>,
    calc: RegionCalculator,
    stats: Arc<Statistics>,
    offer_expiry: Duration,
}

impl CandidateFinder {
    #[must_use]
    pub fn new(
        files: Arc<FileRegistry>,
        clients: Arc<ClientRegistry>,
        calc: RegionCalculator,
        stats: Arc<Statistics>,
        offer_expiry: Duration,
    ) -> Self {
        Self {
            files,
            clients,
            calc,
            stats,
            offer_expiry,
        }
    }

    /// One pass over every client and every file it has reported on
    pub async fn cycle(&self) -> FinderReport {
        let mut report = FinderReport::default();
        for client in self.clients.clients() {
            report.expired += client.expire_offers(Instant::now(), self.offer_expiry);

            let reported: Vec<(FileId, Arc<TrackedFile>)> = client
                .files
                .iter()
                .map(|e| (*e.key(), Arc::clone(e.value())))
                .collect();

            for (file_id, client_file) in reported {
                let Some(server_file) = self.files.get(file_id) else {
                    continue;
                };
                self.check_file(&client, &server_file, &client_file, &mut report).await;
            }
        }
        report
    }

    async fn check_file(
        &self,
        client: &Client,
        server_file: &TrackedFile,
        client_file: &TrackedFile,
        report: &mut FinderReport,
    ) {
        // Keep the client's layout on the server's size so offsets line up
        let size = server_file.size();
        if client_file.size() != size {
            client_file.resize(&self.calc, size, ChunkMode::Merge);
        }

        let server_regions = server_file.regions();
        let decisions: Vec<(&Region, RegionDecision)> = client_file.with_regions(|theirs| {
            server_regions
                .iter()
                .map(|r| (r, decide(r, theirs.get(&r.offset))))
                .collect()
        });

        let mut in_sync = 0;
        for (region, decision) in decisions {
            match decision {
                RegionDecision::InSync => in_sync += 1,
                RegionDecision::Undecided => report.undecided += 1,
                RegionDecision::Transfer { collision } => {
                    let candidate = TransferCandidate::new(server_file.id(), region.offset, region.size);
                    if self.schedule(client, candidate).await {
                        report.enqueued += 1;
                        if collision {
                            report.collisions += 1;
                            self.stats.add_collision();
                            info!(
                                "Collision detected for client {} in [{}] at offset {}",
                                client.id(),
                                server_file.name().display(),
                                region.offset
                            );
                        }
                    } else {
                        report.already_pending += 1;
                    }
                }
            }
        }

        client_file
            .status
            .synced
            .store(percent(in_sync, server_regions.len()), Ordering::Relaxed);
    }

    /// Queue `candidate` unless it is already queued or offered.
    ///
    /// An offer older than the expiry is dropped first so the region can be
    /// queued again. The offered check and the enqueue are not atomic; a poll
    /// racing in between can at worst produce one duplicate transfer, which
    /// rewrites identical bytes.
    pub async fn schedule(&self, client: &Client, candidate: TransferCandidate) -> bool {
        {
            let mut offered = client.offered.lock();
            if let Some(pos) = offered.iter().position(|c| c == &candidate) {
                if !offered[pos].is_expired(Instant::now(), self.offer_expiry) {
                    return false;
                }
                debug!(
                    "Offer expired for client {}: file {} offset {}",
                    client.id(),
                    candidate.file_id,
                    candidate.offset
                );
                offered.remove(pos);
            }
        }

        if client.queue.contains(&candidate) {
            return false;
        }
        client.queue.put(candidate).await
    }

    /// Run a pass every `interval` until cancelled
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                report = self.cycle() => {
                    if report.enqueued > 0 {
                        debug!(
                            "Finder queued {} candidates ({} collisions, {} pending, {} undecided)",
                            report.enqueued, report.collisions, report.already_pending, report.undecided
                        );
                    }
                    if report.expired > 0 {
                        debug!("Finder dropped {} expired offers", report.expired);
                    }
                }
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }
        debug!("candidate finder stopped");
    }
}
