use crate::blockchain::core::chain::{Block, Chain, ChainTip, Sha256Hash};
use crate::blockchain::core::validation::{validate_block_body, validate_header_linkage};
use crate::error::ChainError;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Default)]
struct ChainState {
    blocks: HashMap<Sha256Hash, Block>,
    tip: Option<ChainTip>,
    /// Insertion order, for callers that audit apply ordering.
    insert_log: Vec<Sha256Hash>,
    invalid: HashSet<Sha256Hash>,
    insert_delay: Option<Duration>,
}

/// In-memory block tree with longest-chain fork choice.
///
/// Used by the loopback network and by tests; a production node plugs its
/// persistent chain in through [`Chain`].
#[derive(Debug)]
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Create a chain holding only `genesis`.
    pub fn new(genesis: Block) -> Self {
        let hash = genesis.hash();
        let tip = ChainTip { hash, height: genesis.header.height };
        let mut blocks = HashMap::new();
        blocks.insert(hash, genesis);
        Self {
            state: RwLock::new(ChainState {
                blocks,
                tip: Some(tip),
                insert_log: Vec::new(),
                invalid: HashSet::new(),
                insert_delay: None,
            }),
        }
    }

    /// Build a chain of `count` blocks on top of the shared genesis block.
    pub fn with_height(count: u64) -> Self {
        let chain = MemoryChain::new(Block::genesis());
        let mut parent = Block::genesis();
        for i in 1..=count {
            let block = Block::child_of(&parent, vec![i.to_le_bytes().to_vec()]);
            // Blocks built here are well-formed by construction.
            let _ = chain.validate_and_insert(&block);
            parent = block;
        }
        chain.state.write().insert_log.clear();
        chain
    }

    pub fn height(&self) -> u64 {
        self.current_tip().height
    }

    pub fn block(&self, hash: &Sha256Hash) -> Option<Block> {
        self.state.read().blocks.get(hash).cloned()
    }

    /// Block at `height` on the best chain.
    pub fn block_at(&self, height: u64) -> Option<Block> {
        let state = self.state.read();
        let mut cursor = state.tip.map(|t| t.hash)?;
        loop {
            let block = state.blocks.get(&cursor)?;
            if block.header.height == height {
                return Some(block.clone());
            }
            if block.header.height < height || block.header.height == 0 {
                return None;
            }
            cursor = block.header.previous_hash;
        }
    }

    /// Best-chain headers following the first locator hash this chain knows,
    /// at most `limit` of them.
    pub fn headers_after(&self, locator: &[Sha256Hash], limit: usize) -> Vec<crate::blockchain::BlockHeader> {
        let start = {
            let state = self.state.read();
            locator
                .iter()
                .find_map(|hash| state.blocks.get(hash).map(|b| b.header.height))
                .unwrap_or(0)
        };
        let tip = self.height();
        let mut headers = Vec::new();
        let mut height = start + 1;
        while height <= tip && headers.len() < limit {
            match self.block_at(height) {
                Some(block) => headers.push(block.header),
                None => break,
            }
            height += 1;
        }
        headers
    }

    /// Hashes in the order they were accepted by `validate_and_insert`.
    pub fn insert_log(&self) -> Vec<Sha256Hash> {
        self.state.read().insert_log.clone()
    }

    /// Make consensus validation refuse `hash` from now on.
    pub fn mark_invalid(&self, hash: Sha256Hash) {
        self.state.write().invalid.insert(hash);
    }

    /// Slow every insertion down, to emulate an expensive storage engine.
    pub fn set_insert_delay(&self, delay: Duration) {
        self.state.write().insert_delay = Some(delay);
    }
}

impl Chain for MemoryChain {
    fn current_tip(&self) -> ChainTip {
        self.state
            .read()
            .tip
            .unwrap_or(ChainTip { hash: [0u8; 32], height: 0 })
    }

    fn has_block(&self, hash: &Sha256Hash) -> bool {
        self.state.read().blocks.contains_key(hash)
    }

    fn validate_and_insert(&self, block: &Block) -> Result<u64, ChainError> {
        let delay = self.state.read().insert_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let hash = block.hash();
        let mut state = self.state.write();

        if state.blocks.contains_key(&hash) {
            return Err(ChainError::BlockAlreadyExists);
        }
        if state.invalid.contains(&hash) {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} is marked invalid.",
                hex::encode(hash)
            )));
        }

        let parent_height = match state.blocks.get(&block.header.previous_hash) {
            Some(parent) => parent.header.height,
            None => return Err(ChainError::OrphanBlock),
        };
        validate_header_linkage(&block.header, &block.header.previous_hash, parent_height)?;
        validate_block_body(block)?;

        let height = block.header.height;
        state.blocks.insert(hash, block.clone());
        state.insert_log.push(hash);

        let extends_best = state.tip.map_or(true, |tip| height > tip.height);
        if extends_best {
            state.tip = Some(ChainTip { hash, height });
        }

        Ok(height)
    }
}
