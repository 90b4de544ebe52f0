//! Peer collaborator contract and an in-process loopback network.
//!
//! The sync manager talks to peers only through [`Peer`]; replies flow back
//! into the manager as events through a [`SyncHandle`]. [`ChannelPeer`]
//! forwards requests onto a channel, and [`spawn_loopback_peer`] serves those
//! requests from a local [`MemoryChain`], which is how the CLI simulation and
//! the integration tests stand up a network without sockets.

use crate::blockchain::{MemoryChain, Sha256Hash};
use crate::sync::SyncHandle;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Opaque handle identifying one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Block hashes ordered from the newest known header back towards the chain
/// tip; the remote answers with headers following the first hash it knows.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockLocator(pub Vec<Sha256Hash>);

impl BlockLocator {
    pub fn hashes(&self) -> &[Sha256Hash] {
        &self.0
    }

    /// The newest hash in the locator.
    pub fn tip(&self) -> Option<&Sha256Hash> {
        self.0.first()
    }
}

/// Outbound half of a peer connection.
///
/// Sends return `false` when the connection is already gone; the caller
/// relies on the request deadline or the disconnect event to recover.
pub trait Peer: Send + Sync {
    fn id(&self) -> PeerId;

    fn send_headers_request(&self, locator: &BlockLocator) -> bool;

    fn send_block_request(&self, hash: &Sha256Hash) -> bool;

    fn disconnect(&self, reason: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    GetHeaders(BlockLocator),
    GetBlock(Sha256Hash),
    Disconnect(String),
}

/// A [`Peer`] that queues its requests on an unbounded channel.
#[derive(Debug)]
pub struct ChannelPeer {
    id: PeerId,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl ChannelPeer {
    pub fn new(id: PeerId) -> (Self, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }
}

impl Peer for ChannelPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    fn send_headers_request(&self, locator: &BlockLocator) -> bool {
        self.tx.send(PeerCommand::GetHeaders(locator.clone())).is_ok()
    }

    fn send_block_request(&self, hash: &Sha256Hash) -> bool {
        self.tx.send(PeerCommand::GetBlock(*hash)).is_ok()
    }

    fn disconnect(&self, reason: &str) {
        let _ = self.tx.send(PeerCommand::Disconnect(reason.to_string()));
    }
}

/// Behaviour of a loopback peer.
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    pub max_headers: usize,
    pub latency: Duration,
    /// Upper bound of a random extra delay added to every reply.
    pub jitter: Duration,
    /// When false, block requests are swallowed, which looks like a stall.
    pub answer_blocks: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            max_headers: 2000,
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            answer_blocks: true,
        }
    }
}

/// Serve requests for `id` from `chain`, replying through `handle`.
///
/// The caller still has to announce the peer with
/// [`SyncHandle::peer_connected`]. The task ends when the manager drops the
/// peer, asks it to disconnect, or stops accepting events.
pub fn spawn_loopback_peer(
    id: PeerId,
    chain: Arc<MemoryChain>,
    handle: SyncHandle,
    options: LoopbackOptions,
) -> (Arc<ChannelPeer>, JoinHandle<()>) {
    let (peer, mut rx) = ChannelPeer::new(id);
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let delay = {
                let jitter_ms = options.jitter.as_millis() as u64;
                let extra = if jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=jitter_ms)
                } else {
                    0
                };
                options.latency + Duration::from_millis(extra)
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let sent = match command {
                PeerCommand::GetHeaders(locator) => {
                    let headers = chain.headers_after(locator.hashes(), options.max_headers);
                    handle.headers_received(id, headers).await
                }
                PeerCommand::GetBlock(hash) => {
                    if !options.answer_blocks {
                        continue;
                    }
                    match chain.block(&hash) {
                        Some(block) => handle.block_received(id, block).await,
                        None => handle.not_found(id, vec![hash]).await,
                    }
                }
                PeerCommand::Disconnect(reason) => {
                    debug!(%id, %reason, "Loopback peer asked to disconnect");
                    let _ = handle.peer_disconnected(id).await;
                    break;
                }
            };

            if sent.is_err() {
                break;
            }
        }
    });
    (Arc::new(peer), task)
}
