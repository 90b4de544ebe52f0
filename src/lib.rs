//! TrinityChain netsync - headers-first block synchronization for TrinityChain nodes
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Chain Collaborator
//! - [`blockchain`] - Block types, header validation and the [`blockchain::Chain`] contract
//!
//! ## Networking
//! - [`network`] - Peer contract and the in-process loopback network
//!
//! ## Synchronization
//! - [`sync`] - Sync manager, state machine, download scheduler and orphan pool
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Chain Collaborator
// ============================================================================
pub mod blockchain;

// ============================================================================
// Networking
// ============================================================================
pub mod network;

// ============================================================================
// Synchronization
// ============================================================================
pub mod sync;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{Result, SyncError};
pub use sync::{SyncHandle, SyncManager, SyncPhase, SyncStatus};
