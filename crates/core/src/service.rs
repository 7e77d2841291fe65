//! The operations a replica calls on the server

use std::time::Duration;

use async_trait::async_trait;

use crate::client::ClientId;
use crate::error::Result;
use crate::file::{FileId, FileMetadata};
use crate::messages::{
    ClientRegionReport, FastDigestReport, FileProgress, RegionPayload, SlowDigestReport,
};

/// Server side of the sync protocol.
///
/// Implemented by the engine itself and by RPC clients that forward to a
/// remote engine, so a replica runs unchanged over either.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Allocate a new client
    async fn introduce(&self) -> Result<ClientId>;

    /// Server files that exist on disk, most recently modified first
    async fn list_files(&self) -> Result<Vec<FileMetadata>>;

    /// Record the digests of a region the client has written.
    /// Also confirms the matching offer.
    async fn report_client_region(&self, report: ClientRegionReport) -> Result<()>;

    async fn report_fast_digests(&self, batch: Vec<FastDigestReport>) -> Result<()>;

    async fn report_slow_digests(&self, batch: Vec<SlowDigestReport>) -> Result<()>;

    /// The client has created `file_id` as zero bytes
    async fn report_blank_file(&self, client_id: ClientId, file_id: FileId) -> Result<()>;

    /// Next region the client should write, or `None` if nothing arrived
    /// within `timeout`
    async fn poll_transfer_candidate(
        &self,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Option<RegionPayload>>;

    /// Per-file progress for one client, sorted by name
    async fn progress(&self, client_id: ClientId) -> Result<Vec<FileProgress>>;
}
