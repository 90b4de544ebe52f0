use super::applier::ApplyOutcome;
use crate::blockchain::{Block, BlockHeader, Sha256Hash};
use crate::network::{BlockLocator, Peer, PeerId};
use std::sync::Arc;

/// Everything the dispatcher reacts to.
pub enum SyncEvent {
    PeerConnected {
        peer: Arc<dyn Peer>,
        height: u64,
    },
    HeadersReceived {
        peer: PeerId,
        headers: Vec<BlockHeader>,
    },
    BlockReceived {
        peer: PeerId,
        block: Block,
    },
    BlockRejected {
        peer: PeerId,
        hash: Sha256Hash,
        reason: String,
    },
    NotFound {
        peer: PeerId,
        hashes: Vec<Sha256Hash>,
    },
    /// Block announcements.
    Inventory {
        peer: PeerId,
        hashes: Vec<Sha256Hash>,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    /// A chain apply finished on the worker.
    ApplyCompleted {
        hash: Sha256Hash,
        outcome: ApplyOutcome,
    },
    Tick,
    Shutdown,
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::PeerConnected { .. } => "peer_connected",
            SyncEvent::HeadersReceived { .. } => "headers",
            SyncEvent::BlockReceived { .. } => "block",
            SyncEvent::BlockRejected { .. } => "reject",
            SyncEvent::NotFound { .. } => "not_found",
            SyncEvent::Inventory { .. } => "inventory",
            SyncEvent::PeerDisconnected { .. } => "peer_disconnected",
            SyncEvent::ApplyCompleted { .. } => "apply_completed",
            SyncEvent::Tick => "tick",
            SyncEvent::Shutdown => "shutdown",
        }
    }
}

/// Side effects requested by [`super::SyncState`]; the dispatcher carries
/// them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    RequestHeaders { peer: PeerId, locator: BlockLocator },
    RequestBlock { peer: PeerId, hash: Sha256Hash },
    ApplyBlock { block: Block },
    DisconnectPeer { peer: PeerId, reason: String },
}
