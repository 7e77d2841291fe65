//! Replica and engine in one process, talking over a real TCP socket

use std::sync::Arc;
use std::time::Duration;

use driftsync_core::directory::ScanMode;
use driftsync_core::{Replica, SyncConfig, SyncEngine, SyncService};
use driftsync_transport::{RpcClient, TcpChannel, TcpServer, connect};
use tempfile::TempDir;

async fn serve(engine: &Arc<SyncEngine>) -> (std::net::SocketAddr, tokio_util::sync::CancellationToken) {
    let server = TcpServer::bind("127.0.0.1:0", engine.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = server.cancellation();
    tokio::spawn(server.run());
    (addr, cancel)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_cycle_over_tcp() {
    let server_dir = TempDir::new().unwrap();
    let client_dir = TempDir::new().unwrap();
    let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::create_dir_all(server_dir.path().join("sub")).unwrap();
    std::fs::write(server_dir.path().join("sub/data.bin"), &content).unwrap();

    let mut config = SyncConfig::default();
    config.engine.region_size = 64 * 1024;
    config.replica.poll_timeout_ms = 200;
    let engine = Arc::new(SyncEngine::new(server_dir.path(), &config));
    engine.run_scan_cycle(ScanMode::Fast).await;
    engine.run_scan_cycle(ScanMode::Slow).await;
    let (addr, cancel) = serve(&engine).await;

    let remote = Arc::new(connect(addr).await.unwrap());
    let replica = Replica::new(client_dir.path(), remote.clone(), &config);
    let client_id = replica.introduce().await.unwrap();
    replica.refresh().await.unwrap();

    let found = engine.run_finder_cycle().await;
    assert_eq!(found.enqueued, 4);

    let mut pulled = 0;
    while replica.pull_once().await.unwrap() {
        pulled += 1;
    }
    assert_eq!(pulled, 4);
    assert_eq!(
        std::fs::read(client_dir.path().join("sub/data.bin")).unwrap(),
        content
    );

    engine.run_finder_cycle().await;
    engine.update_progress();
    let progress = remote.progress(client_id).await.unwrap();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].synced_percent, 100);

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_client_over_tcp() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SyncEngine::new(dir.path(), &SyncConfig::default()));
    let (addr, cancel) = serve(&engine).await;

    let remote = connect(addr).await.unwrap();
    let err = remote
        .poll_transfer_candidate(4242, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(err.unknown_client(), Some(4242));

    // The connection survives an error response
    assert!(remote.list_files().await.unwrap().is_empty());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_polls_do_not_serialize() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(SyncEngine::new(dir.path(), &SyncConfig::default()));
    let (addr, cancel) = serve(&engine).await;

    let remote = Arc::new(connect(addr).await.unwrap());
    let client_id = remote.introduce().await.unwrap();

    let started = std::time::Instant::now();
    let polls: Vec<_> = (0..3)
        .map(|_| {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                remote
                    .poll_transfer_candidate(client_id, Duration::from_millis(500))
                    .await
            })
        })
        .collect();
    for poll in polls {
        assert!(poll.await.unwrap().unwrap().is_none());
    }
    assert!(started.elapsed() < Duration::from_millis(1400));
    cancel.cancel();
}

#[tokio::test]
async fn test_call_gives_up_on_silent_server() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let channel = TcpChannel::connect(addr)
        .await
        .unwrap()
        .with_call_timeout(Duration::from_millis(100));
    let remote = RpcClient::new(channel);

    let started = std::time::Instant::now();
    let err = remote.introduce().await.unwrap_err();
    assert!(err.to_string().contains("No response"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}
