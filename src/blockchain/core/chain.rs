use crate::error::ChainError;
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub timestamp: u64,
    pub previous_hash: Sha256Hash,
    pub merkle_root: Sha256Hash,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.merkle_root);
        hasher.update(self.nonce.to_le_bytes());
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Opaque transaction payloads; their meaning belongs to the chain.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn new(
        height: u64,
        previous_hash: Sha256Hash,
        timestamp: u64,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        let merkle_root = Block::calculate_merkle_root(&transactions);

        Block {
            header: BlockHeader {
                height,
                timestamp,
                previous_hash,
                merkle_root,
                nonce: 0,
            },
            transactions,
        }
    }

    /// Genesis block shared by every node of a network.
    pub fn genesis() -> Self {
        Block::new(0, [0u8; 32], 1672531200000, vec![b"trinity genesis".to_vec()])
    }

    /// Build the next block on top of `parent`.
    pub fn child_of(parent: &Block, transactions: Vec<Vec<u8>>) -> Self {
        Block::new(
            parent.header.height + 1,
            parent.hash(),
            parent.header.timestamp + 30_000,
            transactions,
        )
    }

    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn parent_hash(&self) -> Sha256Hash {
        self.header.previous_hash
    }

    pub fn calculate_merkle_root(transactions: &[Vec<u8>]) -> Sha256Hash {
        let mut hasher = Sha256::new();
        for tx in transactions {
            let tx_hash: Sha256Hash = Sha256::digest(tx).into();
            hasher.update(tx_hash);
        }
        hasher.finalize().into()
    }
}

/// Hash and height of the best block the chain currently knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: Sha256Hash,
    pub height: u64,
}

/// Ledger storage and consensus engine the sync manager feeds blocks into.
///
/// Implementations own block validity and fork choice. `validate_and_insert`
/// is never called concurrently by the sync manager; reads may overlap an
/// insertion and must be internally synchronized.
pub trait Chain: Send + Sync + 'static {
    fn current_tip(&self) -> ChainTip;

    fn has_block(&self, hash: &Sha256Hash) -> bool;

    /// Validate `block` and connect it. Returns the block's height on success.
    fn validate_and_insert(&self, block: &Block) -> Result<u64, ChainError>;
}
