//! Server side: turn a request frame into a call on a [`SyncService`]

use std::time::Duration;

use driftsync_core::{Message, SyncError, SyncService};
use tracing::debug;

/// Longest poll a remote client may ask the server to hold open
pub const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Answer one request. Every request gets exactly one response; failures
/// become error frames.
pub async fn dispatch(service: &dyn SyncService, request: Message) -> Message {
    let result = match request {
        Message::Introduce => service
            .introduce()
            .await
            .map(|client_id| Message::Introduced { client_id }),
        Message::ListFiles => service.list_files().await.map(Message::FileList),
        Message::ClientRegion(report) => service.report_client_region(report).await.map(|()| Message::Ok),
        Message::FastDigests(batch) => service.report_fast_digests(batch).await.map(|()| Message::Ok),
        Message::SlowDigests(batch) => service.report_slow_digests(batch).await.map(|()| Message::Ok),
        Message::BlankFile { client_id, file_id } => service
            .report_blank_file(client_id, file_id)
            .await
            .map(|()| Message::Ok),
        Message::Poll {
            client_id,
            timeout_ms,
        } => {
            let timeout = Duration::from_millis(u64::from(timeout_ms)).min(MAX_POLL_TIMEOUT);
            service
                .poll_transfer_candidate(client_id, timeout)
                .await
                .map(|found| found.map_or(Message::NothingToTransfer, Message::RegionData))
        }
        Message::ProgressReq { client_id } => service.progress(client_id).await.map(Message::Progress),
        other => {
            debug!("Rejecting non-request message {:#04x}", other.kind());
            Err(SyncError::transport(format!(
                "message type {:#04x} is not a request",
                other.kind()
            )))
        }
    };

    result.unwrap_or_else(|e| Message::error(&e))
}
