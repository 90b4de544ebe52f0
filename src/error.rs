//! Error types for TrinityChain block synchronization

use crate::blockchain::Sha256Hash;
use crate::network::PeerId;
use std::fmt;
use thiserror::Error;

/// Failures reported by the chain collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    InvalidBlockLinkage,
    InvalidBlock(String),
    InvalidMerkleRoot,
    OrphanBlock,
    BlockAlreadyExists,
    DatabaseError(String),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidBlockLinkage => write!(f, "Invalid block linkage"),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::InvalidMerkleRoot => write!(f, "Invalid Merkle root"),
            ChainError::OrphanBlock => write!(f, "Orphan block"),
            ChainError::BlockAlreadyExists => write!(f, "Block already exists"),
            ChainError::DatabaseError(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl ChainError {
    /// Whether the chain refused the block on consensus grounds, as opposed to
    /// failing to store it.
    pub fn is_consensus_rejection(&self) -> bool {
        matches!(
            self,
            ChainError::InvalidBlockLinkage | ChainError::InvalidBlock(_) | ChainError::InvalidMerkleRoot
        )
    }
}

/// Errors surfaced by the synchronization manager.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Malformed or out-of-order data from a peer.
    #[error("protocol violation by peer {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: String },

    /// A request outlived its deadline.
    #[error("request for {what} to peer {peer} stalled")]
    Stalled { peer: PeerId, what: String },

    /// The chain refused a block under its consensus rules.
    #[error("chain rejected block {}: {reason}", hex::encode(.hash))]
    ChainRejected { hash: Sha256Hash, reason: String },

    /// A second request for something already in flight. Scheduler bug.
    #[error("duplicate request for {what}: already in flight to peer {existing}, attempted peer {attempted}")]
    DuplicateRequest {
        what: String,
        existing: PeerId,
        attempted: PeerId,
    },

    #[error("sync manager is shutting down")]
    ShutdownInProgress,

    #[error("sync event channel closed")]
    EventChannelClosed,

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    /// The dispatcher task panicked or was cancelled.
    #[error("sync dispatcher task failed: {0}")]
    DispatcherFailed(String),
}

impl SyncError {
    /// Invariant violations that must terminate the dispatcher.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::DuplicateRequest { .. })
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_duplicate_request_is_fatal() {
        let dup = SyncError::DuplicateRequest {
            what: "block 00".to_string(),
            existing: PeerId(1),
            attempted: PeerId(2),
        };
        assert!(dup.is_fatal());
        assert!(!SyncError::ShutdownInProgress.is_fatal());
        assert!(!SyncError::Chain(ChainError::OrphanBlock).is_fatal());
    }

    #[test]
    fn test_consensus_rejection_classification() {
        assert!(ChainError::InvalidBlock("bad".to_string()).is_consensus_rejection());
        assert!(ChainError::InvalidMerkleRoot.is_consensus_rejection());
        assert!(!ChainError::DatabaseError("disk".to_string()).is_consensus_rejection());
        assert!(!ChainError::OrphanBlock.is_consensus_rejection());
    }
}
