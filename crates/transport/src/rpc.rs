//! Client side: a [`SyncService`] that forwards every call over a [`Channel`]

use std::time::Duration;

use async_trait::async_trait;
use driftsync_core::{
    ClientId, ClientRegionReport, FastDigestReport, FileId, FileMetadata, FileProgress, Message,
    RegionPayload, Result, SlowDigestReport, SyncError, SyncService,
};

/// One request, one response
#[async_trait]
pub trait Channel: Send + Sync {
    async fn call(&self, request: Message) -> color_eyre::Result<Message>;
}

/// Remote [`SyncService`]
pub struct RpcClient<C> {
    channel: C,
}

impl<C: Channel> RpcClient<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    async fn call(&self, request: Message) -> Result<Message> {
        let kind = request.kind();
        match self.channel.call(request).await {
            Ok(Message::Error(wire)) => Err(wire.into()),
            Ok(response) => Ok(response),
            Err(e) => Err(SyncError::transport(format!(
                "request {kind:#04x} failed: {e:#}"
            ))),
        }
    }

    async fn expect_ok(&self, request: Message) -> Result<()> {
        match self.call(request).await? {
            Message::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Message) -> SyncError {
    SyncError::transport(format!("unexpected response {:#04x}", response.kind()))
}

#[async_trait]
impl<C: Channel> SyncService for RpcClient<C> {
    async fn introduce(&self) -> Result<ClientId> {
        match self.call(Message::Introduce).await? {
            Message::Introduced { client_id } => Ok(client_id),
            other => Err(unexpected(&other)),
        }
    }

    async fn list_files(&self) -> Result<Vec<FileMetadata>> {
        match self.call(Message::ListFiles).await? {
            Message::FileList(files) => Ok(files),
            other => Err(unexpected(&other)),
        }
    }

    async fn report_client_region(&self, report: ClientRegionReport) -> Result<()> {
        self.expect_ok(Message::ClientRegion(report)).await
    }

    async fn report_fast_digests(&self, batch: Vec<FastDigestReport>) -> Result<()> {
        self.expect_ok(Message::FastDigests(batch)).await
    }

    async fn report_slow_digests(&self, batch: Vec<SlowDigestReport>) -> Result<()> {
        self.expect_ok(Message::SlowDigests(batch)).await
    }

    async fn report_blank_file(&self, client_id: ClientId, file_id: FileId) -> Result<()> {
        self.expect_ok(Message::BlankFile { client_id, file_id }).await
    }

    async fn poll_transfer_candidate(
        &self,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Option<RegionPayload>> {
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        match self.call(Message::Poll { client_id, timeout_ms }).await? {
            Message::RegionData(payload) => Ok(Some(payload)),
            Message::NothingToTransfer => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    async fn progress(&self, client_id: ClientId) -> Result<Vec<FileProgress>> {
        match self.call(Message::ProgressReq { client_id }).await? {
            Message::Progress(report) => Ok(report),
            other => Err(unexpected(&other)),
        }
    }
}
