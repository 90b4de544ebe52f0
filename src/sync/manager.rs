//! Public entry point: starts and stops the dispatcher and hands out
//! [`SyncHandle`]s for feeding it events.

use super::dispatcher::Dispatcher;
use super::event::SyncEvent;
use super::{SyncPeerInfo, SyncStatus};
use crate::blockchain::{Block, BlockHeader, Chain, Sha256Hash};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::network::{Peer, PeerId};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Cloneable sender side of the dispatcher's event queue.
///
/// Every method fails with [`SyncError::ShutdownInProgress`] once
/// [`SyncManager::stop`] has been called.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncEvent>,
    stopping: Arc<AtomicBool>,
}

impl SyncHandle {
    pub async fn submit(&self, event: SyncEvent) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(SyncError::ShutdownInProgress);
        }
        self.tx.send(event).await.map_err(|_| SyncError::EventChannelClosed)
    }

    /// Announce a connection that finished its handshake at `height`.
    pub async fn peer_connected(&self, peer: Arc<dyn Peer>, height: u64) -> Result<()> {
        self.submit(SyncEvent::PeerConnected { peer, height }).await
    }

    pub async fn headers_received(&self, peer: PeerId, headers: Vec<BlockHeader>) -> Result<()> {
        self.submit(SyncEvent::HeadersReceived { peer, headers }).await
    }

    pub async fn block_received(&self, peer: PeerId, block: Block) -> Result<()> {
        self.submit(SyncEvent::BlockReceived { peer, block }).await
    }

    pub async fn block_rejected(&self, peer: PeerId, hash: Sha256Hash, reason: impl Into<String>) -> Result<()> {
        self.submit(SyncEvent::BlockRejected {
            peer,
            hash,
            reason: reason.into(),
        })
        .await
    }

    pub async fn not_found(&self, peer: PeerId, hashes: Vec<Sha256Hash>) -> Result<()> {
        self.submit(SyncEvent::NotFound { peer, hashes }).await
    }

    pub async fn inventory(&self, peer: PeerId, hashes: Vec<Sha256Hash>) -> Result<()> {
        self.submit(SyncEvent::Inventory { peer, hashes }).await
    }

    pub async fn peer_disconnected(&self, peer: PeerId) -> Result<()> {
        self.submit(SyncEvent::PeerDisconnected { peer }).await
    }
}

pub struct SyncManager {
    config: SyncConfig,
    chain: Arc<dyn Chain>,
    started: AtomicBool,
    stopping: Arc<AtomicBool>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    shutdown_tx: watch::Sender<bool>,
    status: Arc<RwLock<SyncStatus>>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    /// How the dispatcher ended, handed to every caller of [`SyncManager::stop`].
    outcome: tokio::sync::Mutex<Option<Result<()>>>,
}

impl SyncManager {
    pub fn new(config: SyncConfig, chain: Arc<dyn Chain>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        let status = SyncStatus {
            local_height: chain.current_tip().height,
            ..SyncStatus::default()
        };
        Self {
            config,
            chain,
            started: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown_tx,
            status: Arc::new(RwLock::new(status)),
            task: Mutex::new(None),
            outcome: tokio::sync::Mutex::new(None),
        }
    }

    /// Spawn the dispatcher on the current Tokio runtime.
    ///
    /// Returns `Ok(false)` if the manager was already started. Events
    /// submitted before this call are processed once it runs.
    pub fn start(&self) -> Result<bool> {
        // Held until the task is stored, so a concurrent stop() either sees
        // the task or makes this call fail.
        let mut task = self.task.lock();
        if self.stopping.load(Ordering::SeqCst) {
            return Err(SyncError::ShutdownInProgress);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Sync manager already started");
            return Ok(false);
        }
        let Some(events) = self.events_rx.lock().take() else {
            return Ok(false);
        };

        info!(
            local_height = self.chain.current_tip().height,
            margin = self.config.candidate_height_margin,
            "Starting block sync"
        );
        let dispatcher = Dispatcher::new(
            self.config.clone(),
            Arc::clone(&self.chain),
            events,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.status),
        );
        *task = Some(tokio::spawn(dispatcher.run()));
        Ok(true)
    }

    /// Stop the dispatcher and wait for it to exit. Outstanding requests are
    /// abandoned; a block already handed to the chain is allowed to finish.
    ///
    /// Returns the dispatcher's result: an invariant violation that ended it,
    /// or [`SyncError::DispatcherFailed`] if the task panicked. Later calls
    /// wait for the first one and return the same result.
    pub async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("Sync manager already stopping");
        }
        self.shutdown_tx.send_replace(true);

        let mut outcome = self.outcome.lock().await;
        if let Some(result) = outcome.as_ref() {
            return result.clone();
        }

        let task = self.task.lock().take();
        let result = match task {
            None => Ok(()),
            Some(task) => match task.await {
                Ok(result) => {
                    info!("Block sync stopped");
                    result
                }
                Err(e) => {
                    error!("Sync dispatcher task failed: {}", e);
                    Err(SyncError::DispatcherFailed(e.to_string()))
                }
            },
        };
        *outcome = Some(result.clone());
        result
    }

    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            tx: self.events_tx.clone(),
            stopping: Arc::clone(&self.stopping),
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }

    /// The peer currently driving sync, as of the last processed event.
    pub fn sync_peer_info(&self) -> Option<SyncPeerInfo> {
        self.status.read().sync_peer
    }

    pub fn is_current(&self) -> bool {
        self.status.read().is_current()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }
}
