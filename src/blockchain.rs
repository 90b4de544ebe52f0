// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// block types, the chain collaborator contract and an in-memory chain.

pub mod core;
pub use core::*;
