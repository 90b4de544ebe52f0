//! Serialized hand-off of blocks to the chain collaborator.

use super::event::SyncEvent;
use crate::blockchain::{Block, Chain};
use crate::error::{ChainError, SyncError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// How a chain apply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { height: u64 },
    /// The chain already had the block.
    AlreadyHave,
    /// The chain does not know the parent.
    MissingParent,
    /// Refused under consensus rules.
    Rejected(String),
    /// The chain could not process the block (storage failure, crash).
    Failed(String),
}

impl From<Result<u64, ChainError>> for ApplyOutcome {
    fn from(result: Result<u64, ChainError>) -> Self {
        match result {
            Ok(height) => ApplyOutcome::Applied { height },
            Err(ChainError::BlockAlreadyExists) => ApplyOutcome::AlreadyHave,
            Err(ChainError::OrphanBlock) => ApplyOutcome::MissingParent,
            Err(e) if e.is_consensus_rejection() => ApplyOutcome::Rejected(e.to_string()),
            Err(e) => ApplyOutcome::Failed(SyncError::Chain(e).to_string()),
        }
    }
}

/// Runs `Chain::validate_and_insert` on a blocking worker, one block at a
/// time, and reports each result back as [`SyncEvent::ApplyCompleted`].
pub struct ChainApplier {
    chain: Arc<dyn Chain>,
    completions: mpsc::Sender<SyncEvent>,
    in_flight: Option<JoinHandle<()>>,
}

impl ChainApplier {
    pub fn new(chain: Arc<dyn Chain>, completions: mpsc::Sender<SyncEvent>) -> Self {
        Self {
            chain,
            completions,
            in_flight: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Start applying `block`. The dispatcher only calls this after the
    /// previous apply has reported back.
    pub fn apply(&mut self, block: Block) {
        let chain = Arc::clone(&self.chain);
        let completions = self.completions.clone();
        self.in_flight = Some(tokio::task::spawn_blocking(move || {
            let hash = block.hash();
            let outcome = match catch_unwind(AssertUnwindSafe(|| chain.validate_and_insert(&block))) {
                Ok(result) => ApplyOutcome::from(result),
                Err(_) => ApplyOutcome::Failed("chain panicked while inserting block".to_string()),
            };
            debug!(hash = %hex::encode(hash), ?outcome, "Chain apply finished");
            // The dispatcher may already be gone during shutdown.
            let _ = completions.blocking_send(SyncEvent::ApplyCompleted { hash, outcome });
        }));
    }

    /// Wait for the in-flight apply, if any, to finish.
    pub async fn wait_idle(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(e) = handle.await {
                error!("Chain apply worker failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::MemoryChain;

    #[test]
    fn test_outcome_translation() {
        assert_eq!(ApplyOutcome::from(Ok(7)), ApplyOutcome::Applied { height: 7 });
        assert_eq!(
            ApplyOutcome::from(Err(ChainError::BlockAlreadyExists)),
            ApplyOutcome::AlreadyHave
        );
        assert_eq!(ApplyOutcome::from(Err(ChainError::OrphanBlock)), ApplyOutcome::MissingParent);
        assert!(matches!(
            ApplyOutcome::from(Err(ChainError::InvalidMerkleRoot)),
            ApplyOutcome::Rejected(_)
        ));
        assert!(matches!(
            ApplyOutcome::from(Err(ChainError::DatabaseError("disk full".to_string()))),
            ApplyOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_apply_reports_completion() {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            let chain = Arc::new(MemoryChain::new(Block::genesis()));
            let (tx, mut rx) = mpsc::channel(4);
            let mut applier = ChainApplier::new(chain.clone(), tx);

            let block = Block::child_of(&Block::genesis(), vec![b"tx".to_vec()]);
            applier.apply(block.clone());
            applier.wait_idle().await;
            assert!(!applier.is_busy());

            match rx.recv().await {
                Some(SyncEvent::ApplyCompleted { hash, outcome }) => {
                    assert_eq!(hash, block.hash());
                    assert_eq!(outcome, ApplyOutcome::Applied { height: 1 });
                }
                _ => panic!("expected an apply completion"),
            }
            assert!(chain.has_block(&block.hash()));
        })
        .await
        .expect("test_apply_reports_completion timed out");
    }
}
