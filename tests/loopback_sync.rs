//! Integration tests driving the sync manager against loopback peers

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use trinity_netsync::blockchain::{Block, Chain, MemoryChain};
use trinity_netsync::config::{load_config_from, SyncConfig};
use trinity_netsync::network::{spawn_loopback_peer, LoopbackOptions, PeerId};
use trinity_netsync::{SyncError, SyncManager, SyncPhase};

/// Defaults tuned so a small simulated sync finishes quickly
fn fast_config() -> SyncConfig {
    SyncConfig {
        max_headers_per_batch: 64,
        tick_interval_ms: 20,
        ..SyncConfig::default()
    }
}

/// Poll until the manager reports it is current
async fn wait_until_current(manager: &SyncManager) {
    while !manager.is_current() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connect `count` loopback peers serving `remote`, numbered from zero
async fn connect_peers(
    manager: &SyncManager,
    remote: &Arc<MemoryChain>,
    count: u64,
    options: impl Fn(u64) -> LoopbackOptions,
) -> Result<(), SyncError> {
    let handle = manager.handle();
    for i in 0..count {
        let (peer, _task) = spawn_loopback_peer(PeerId(i), Arc::clone(remote), handle.clone(), options(i));
        handle.peer_connected(peer, remote.height()).await?;
    }
    Ok(())
}

/// Every block was inserted after its parent, starting above `start_height`
fn assert_parent_before_child(chain: &MemoryChain, start_height: u64) {
    let mut last_height = start_height;
    for hash in chain.insert_log() {
        let block = chain.block(&hash).expect("logged block is stored");
        assert_eq!(block.header.height, last_height + 1);
        last_height = block.header.height;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_from_genesis_with_three_peers() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let remote = Arc::new(MemoryChain::with_height(300));
        let local = Arc::new(MemoryChain::with_height(0));
        let manager = SyncManager::new(fast_config(), local.clone());
        assert!(manager.start().unwrap());

        connect_peers(&manager, &remote, 3, |_| LoopbackOptions {
            max_headers: 64,
            latency: Duration::from_millis(1),
            jitter: Duration::from_millis(2),
            ..LoopbackOptions::default()
        })
        .await
        .unwrap();

        wait_until_current(&manager).await;
        assert_eq!(local.height(), 300);
        assert_eq!(local.current_tip().hash, remote.current_tip().hash);
        assert_parent_before_child(&local, 0);

        let status = manager.status();
        assert_eq!(status.phase, SyncPhase::Current);
        assert_eq!(status.blocks_applied, 300);
        assert_eq!(status.sync_peer.map(|p| p.peer), Some(PeerId(0)));

        manager.stop().await.unwrap();
    })
    .await
    .expect("test_sync_from_genesis_with_three_peers timed out");
}

#[tokio::test]
async fn test_stalling_peer_does_not_block_sync() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let remote = Arc::new(MemoryChain::with_height(60));
        let local = Arc::new(MemoryChain::with_height(10));
        let config = SyncConfig {
            block_request_timeout_secs: 1,
            ..fast_config()
        };
        let manager = SyncManager::new(config, local.clone());
        manager.start().unwrap();

        // Peer 0 connects first and is picked as sync peer, but never sends blocks.
        connect_peers(&manager, &remote, 2, |i| LoopbackOptions {
            max_headers: 64,
            answer_blocks: i != 0,
            ..LoopbackOptions::default()
        })
        .await
        .unwrap();

        wait_until_current(&manager).await;
        assert_eq!(local.height(), 60);
        assert_parent_before_child(&local, 10);
        assert_eq!(manager.sync_peer_info().map(|p| p.peer), Some(PeerId(1)));

        manager.stop().await.unwrap();
    })
    .await
    .expect("test_stalling_peer_does_not_block_sync timed out");
}

#[tokio::test]
async fn test_sync_peer_disconnect_fails_over() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let remote = Arc::new(MemoryChain::with_height(80));
        let local = Arc::new(MemoryChain::with_height(0));
        let manager = SyncManager::new(fast_config(), local.clone());
        manager.start().unwrap();

        connect_peers(&manager, &remote, 2, |_| LoopbackOptions {
            max_headers: 16,
            latency: Duration::from_millis(2),
            ..LoopbackOptions::default()
        })
        .await
        .unwrap();
        manager.handle().peer_disconnected(PeerId(0)).await.unwrap();

        wait_until_current(&manager).await;
        assert_eq!(local.height(), 80);
        assert_eq!(manager.sync_peer_info().map(|p| p.peer), Some(PeerId(1)));
        assert_eq!(manager.status().peer_count, 1);

        manager.stop().await.unwrap();
    })
    .await
    .expect("test_sync_peer_disconnect_fails_over timed out");
}

#[tokio::test]
async fn test_slow_chain_does_not_stall_dispatcher() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let remote = Arc::new(MemoryChain::with_height(40));
        let local = Arc::new(MemoryChain::with_height(0));
        local.set_insert_delay(Duration::from_millis(5));
        let manager = SyncManager::new(fast_config(), local.clone());
        manager.start().unwrap();

        connect_peers(&manager, &remote, 2, |_| LoopbackOptions::default())
            .await
            .unwrap();

        wait_until_current(&manager).await;
        assert_eq!(local.height(), 40);
        assert_parent_before_child(&local, 0);
        manager.stop().await.unwrap();
    })
    .await
    .expect("test_slow_chain_does_not_stall_dispatcher timed out");
}

#[tokio::test]
async fn test_announced_block_is_fetched_once_current() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let remote = Arc::new(MemoryChain::with_height(20));
        let local = Arc::new(MemoryChain::with_height(0));
        let manager = SyncManager::new(fast_config(), local.clone());
        manager.start().unwrap();

        connect_peers(&manager, &remote, 1, |_| LoopbackOptions::default())
            .await
            .unwrap();
        wait_until_current(&manager).await;

        let tip = remote.block_at(20).unwrap();
        let next = Block::child_of(&tip, vec![b"announced".to_vec()]);
        remote.validate_and_insert(&next).unwrap();
        manager.handle().inventory(PeerId(0), vec![next.hash()]).await.unwrap();

        while local.height() < 21 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(local.has_block(&next.hash()));
        manager.stop().await.unwrap();
    })
    .await
    .expect("test_announced_block_is_fetched_once_current timed out");
}

#[tokio::test]
async fn test_manager_from_config_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[sync]\ncandidate_height_margin = 5\ntick_interval_ms = 20\n\n[logging]\nlevel = \"debug\"\n",
    )?;
    let config = load_config_from(&path)?;
    assert_eq!(config.sync.candidate_height_margin, 5);
    assert_eq!(config.logging.level, "debug");

    tokio::time::timeout(Duration::from_secs(5), async {
        let remote = Arc::new(MemoryChain::with_height(4));
        let local = Arc::new(MemoryChain::with_height(0));
        let manager = SyncManager::new(config.sync.clone(), local.clone());
        manager.start().unwrap();

        // Height 4 is below local height plus the margin of 5.
        connect_peers(&manager, &remote, 1, |_| LoopbackOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = manager.status();
        assert_eq!(status.phase, SyncPhase::Idle);
        assert_eq!(status.peer_count, 1);
        assert_eq!(status.candidate_count, 0);
        assert_eq!(local.height(), 0);

        manager.stop().await.unwrap();
        let err = manager.handle().peer_disconnected(PeerId(0)).await.unwrap_err();
        assert!(matches!(err, SyncError::ShutdownInProgress));
    })
    .await
    .expect("test_manager_from_config_file timed out");
    Ok(())
}
