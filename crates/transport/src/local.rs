//! In-process transport for testing
//!
//! Every call is encoded to a frame and decoded again in both directions, so
//! the codec is exercised without a socket.

use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use driftsync_core::protocol::{HEADER_LEN, parse_header};
use driftsync_core::{Message, SyncService};

use crate::dispatch::dispatch;
use crate::rpc::{Channel, RpcClient};

/// Channel straight into a local service
pub struct LoopbackChannel {
    service: Arc<dyn SyncService>,
}

impl LoopbackChannel {
    pub fn new(service: Arc<dyn SyncService>) -> Self {
        Self { service }
    }
}

/// Remote-style client for a service in this process
pub fn loopback(service: Arc<dyn SyncService>) -> RpcClient<LoopbackChannel> {
    RpcClient::new(LoopbackChannel::new(service))
}

fn reframe(message: &Message) -> Result<Message> {
    let frame = message.encode_frame()?;
    let header: [u8; HEADER_LEN] = frame[..HEADER_LEN]
        .try_into()
        .map_err(|_| eyre!("short frame"))?;
    let (msg_type, len) = parse_header(header)?;
    Message::decode(msg_type, &frame[HEADER_LEN..HEADER_LEN + len as usize])
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn call(&self, request: Message) -> Result<Message> {
        let request = reframe(&request)?;
        let response = dispatch(self.service.as_ref(), request).await;
        reframe(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::directory::ScanMode;
    use driftsync_core::{Replica, SyncConfig, SyncEngine};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_replica_over_loopback() {
        let server_dir = TempDir::new().unwrap();
        let client_dir = TempDir::new().unwrap();
        std::fs::write(server_dir.path().join("a.txt"), b"hello loopback").unwrap();

        let mut config = SyncConfig::default();
        config.replica.poll_timeout_ms = 100;
        let engine = Arc::new(SyncEngine::new(server_dir.path(), &config));
        engine.run_scan_cycle(ScanMode::Fast).await;
        engine.run_scan_cycle(ScanMode::Slow).await;

        let replica = Replica::new(client_dir.path(), Arc::new(loopback(engine.clone())), &config);
        replica.introduce().await.unwrap();
        replica.refresh().await.unwrap();
        engine.run_finder_cycle().await;

        assert!(replica.pull_once().await.unwrap());
        assert!(!replica.pull_once().await.unwrap());
        assert_eq!(
            std::fs::read(client_dir.path().join("a.txt")).unwrap(),
            b"hello loopback"
        );
    }

    #[tokio::test]
    async fn test_errors_cross_the_channel() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(SyncEngine::new(dir.path(), &SyncConfig::default()));
        let client = loopback(engine);

        let err = client.progress(77).await.unwrap_err();
        assert_eq!(err.unknown_client(), Some(77));
    }

    #[tokio::test]
    async fn test_response_frames_are_not_requests() {
        let dir = TempDir::new().unwrap();
        let engine: Arc<dyn SyncService> = Arc::new(SyncEngine::new(dir.path(), &SyncConfig::default()));
        let channel = LoopbackChannel::new(engine);
        let response = channel.call(Message::Ok).await.unwrap();
        assert!(matches!(response, Message::Error(_)));
    }
}
