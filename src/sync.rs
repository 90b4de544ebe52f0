//! Node synchronization module for TrinityChain
//!
//! Keeps the local chain in step with the network using headers-first sync:
//! - One sync peer feeds header batches until it has nothing more to offer
//! - Block bodies are then downloaded in parallel from every candidate peer
//! - Blocks are applied strictly parent-before-child; early arrivals wait in
//!   the orphan pool
//! - Stalled requests are reassigned and slow or lying peers are demoted
//!
//! All sync state is owned by a single dispatcher task. Peers and the chain
//! applier talk to it only through events, so none of it needs locking.

pub mod applier;
pub mod dispatcher;
pub mod event;
pub mod headers;
pub mod manager;
pub mod orphan;
pub mod peer_state;
pub mod progress;
pub mod scheduler;
pub mod state;

pub use applier::{ApplyOutcome, ChainApplier};
pub use event::{SyncAction, SyncEvent};
pub use manager::{SyncHandle, SyncManager};
pub use orphan::OrphanPool;
pub use peer_state::{PeerRecord, PeerTable, RequestKey};
pub use scheduler::DownloadScheduler;
pub use state::SyncState;

use crate::network::PeerId;
use serde::Serialize;
use std::fmt;

/// Overall synchronization phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    /// No usable sync peer.
    #[default]
    Idle,
    /// Fetching header batches from the sync peer.
    HeadersSync,
    /// Fetching and applying bodies for known headers.
    BlocksSync,
    /// Caught up with the sync peer; following announcements.
    Current,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::HeadersSync => "headers-sync",
            SyncPhase::BlocksSync => "blocks-sync",
            SyncPhase::Current => "current",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncPeerInfo {
    pub peer: PeerId,
    pub negotiated_height: u64,
    pub best_height: u64,
}

/// Point-in-time view of the sync manager, for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub sync_peer: Option<SyncPeerInfo>,
    pub local_height: u64,
    pub peer_count: usize,
    pub candidate_count: usize,
    pub pending_headers: usize,
    pub orphan_count: usize,
    pub requests_in_flight: usize,
    pub blocks_applied: u64,
}

impl SyncStatus {
    pub fn is_current(&self) -> bool {
        self.phase == SyncPhase::Current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json() {
        let status = SyncStatus {
            phase: SyncPhase::BlocksSync,
            sync_peer: Some(SyncPeerInfo {
                peer: PeerId(3),
                negotiated_height: 120,
                best_height: 150,
            }),
            local_height: 42,
            ..SyncStatus::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "blocks-sync");
        assert_eq!(json["sync_peer"]["peer"], 3);
        assert_eq!(json["sync_peer"]["best_height"], 150);
        assert_eq!(json["local_height"], 42);
        assert!(!status.is_current());
    }
}
