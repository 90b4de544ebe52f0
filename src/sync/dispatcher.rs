//! The task that owns [`SyncState`] and carries out its actions.

use super::applier::ChainApplier;
use super::event::{SyncAction, SyncEvent};
use super::state::SyncState;
use super::SyncStatus;
use crate::blockchain::Chain;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::network::{Peer, PeerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

const COMPLETION_QUEUE: usize = 16;

pub struct Dispatcher {
    state: SyncState,
    peers: HashMap<PeerId, Arc<dyn Peer>>,
    applier: ChainApplier,
    events: mpsc::Receiver<SyncEvent>,
    completions: mpsc::Receiver<SyncEvent>,
    shutdown: watch::Receiver<bool>,
    status: Arc<RwLock<SyncStatus>>,
    tick_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        config: SyncConfig,
        chain: Arc<dyn Chain>,
        events: mpsc::Receiver<SyncEvent>,
        shutdown: watch::Receiver<bool>,
        status: Arc<RwLock<SyncStatus>>,
    ) -> Self {
        let (completions_tx, completions) = mpsc::channel(COMPLETION_QUEUE);
        let tick_interval = config.tick_interval();
        Self {
            state: SyncState::new(config, Arc::clone(&chain)),
            peers: HashMap::new(),
            applier: ChainApplier::new(chain, completions_tx),
            events,
            completions,
            shutdown,
            status,
            tick_interval,
        }
    }

    /// Process events until shutdown. Returns an error only for invariant
    /// violations, which stop the dispatcher.
    pub async fn run(mut self) -> Result<()> {
        self.publish();
        info!(local_height = self.state.local_height(), "Sync dispatcher started");

        // A receiver subscribed after shutdown was signalled never sees a change.
        let result = if *self.shutdown.borrow_and_update() {
            debug!("Shutdown requested before the dispatcher ran");
            Ok(())
        } else {
            self.event_loop().await
        };

        self.drain().await;
        result
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        SyncEvent::Shutdown
                    } else {
                        continue;
                    }
                }
                Some(event) = self.completions.recv() => event,
                event = self.events.recv() => event.unwrap_or(SyncEvent::Shutdown),
                _ = ticker.tick() => SyncEvent::Tick,
            };

            let stop = matches!(event, SyncEvent::Shutdown);
            trace!(event = event.kind(), "Dispatching sync event");
            if let Err(e) = self.handle(event) {
                if e.is_fatal() {
                    error!("Sync dispatcher stopping: {}", e);
                    return Err(e);
                }
                warn!("Sync event failed: {}", e);
            }
            if stop {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, event: SyncEvent) -> Result<()> {
        let now = Instant::now();
        let result = match event {
            SyncEvent::PeerConnected { peer, height } => {
                let id = peer.id();
                self.peers.entry(id).or_insert(peer);
                self.state.on_peer_connected(id, height, now)
            }
            SyncEvent::HeadersReceived { peer, headers } => self.state.on_headers(peer, headers, now),
            SyncEvent::BlockReceived { peer, block } => self.state.on_block(peer, block, now),
            SyncEvent::BlockRejected { peer, hash, reason } => self.state.on_block_rejected(peer, hash, &reason, now),
            SyncEvent::NotFound { peer, hashes } => self.state.on_not_found(peer, hashes, now),
            SyncEvent::Inventory { peer, hashes } => self.state.on_inventory(peer, hashes, now),
            SyncEvent::PeerDisconnected { peer } => {
                self.peers.remove(&peer);
                self.state.on_peer_disconnected(peer, now)
            }
            SyncEvent::ApplyCompleted { hash, outcome } => self.state.on_apply_completed(hash, outcome, now),
            SyncEvent::Tick => self.state.on_tick(now),
            SyncEvent::Shutdown => {
                self.state.on_shutdown();
                Ok(())
            }
        };
        self.execute();
        self.publish();
        result
    }

    fn execute(&mut self) {
        for action in self.state.take_actions() {
            match action {
                SyncAction::RequestHeaders { peer, locator } => match self.peers.get(&peer) {
                    Some(conn) => {
                        if !conn.send_headers_request(&locator) {
                            debug!(%peer, "Connection closed before headers request was sent");
                        }
                    }
                    None => debug!(%peer, "No connection for headers request"),
                },
                SyncAction::RequestBlock { peer, hash } => match self.peers.get(&peer) {
                    Some(conn) => {
                        if !conn.send_block_request(&hash) {
                            debug!(%peer, "Connection closed before block request was sent");
                        }
                    }
                    None => debug!(%peer, "No connection for block request"),
                },
                SyncAction::ApplyBlock { block } => self.applier.apply(block),
                SyncAction::DisconnectPeer { peer, reason } => {
                    if let Some(conn) = self.peers.remove(&peer) {
                        conn.disconnect(&reason);
                    }
                }
            }
        }
    }

    fn publish(&self) {
        *self.status.write() = self.state.status();
    }

    /// Let the in-flight apply finish and record its result.
    async fn drain(&mut self) {
        self.state.on_shutdown();
        self.applier.wait_idle().await;
        while let Ok(event) = self.completions.try_recv() {
            if let SyncEvent::ApplyCompleted { hash, outcome } = event {
                if let Err(e) = self.state.on_apply_completed(hash, outcome, Instant::now()) {
                    warn!("Failed to record final apply: {}", e);
                }
            }
        }
        self.state.take_actions();
        self.publish();
        info!(
            local_height = self.state.local_height(),
            phase = %self.state.phase(),
            "Sync dispatcher stopped"
        );
    }
}
