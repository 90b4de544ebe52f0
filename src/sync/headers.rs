//! Headers discovered by headers-first sync whose blocks are not applied yet.

use crate::blockchain::{validate_header_linkage, validate_header_sequence, BlockHeader, ChainTip, Sha256Hash};
use crate::error::ChainError;
use crate::network::BlockLocator;
use std::collections::{HashMap, VecDeque};

/// Number of most recent headers listed one by one in a locator before the
/// step starts doubling.
const LOCATOR_DENSE_PREFIX: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderChainError {
    /// Headers in the batch do not chain to each other.
    NotContinuous(ChainError),
    /// The first header's parent is neither pending nor in the chain.
    UnknownParent(Sha256Hash),
    /// The first header's height does not follow its parent.
    BadHeight { expected: u64, got: u64 },
}

impl std::fmt::Display for HeaderChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HeaderChainError::NotContinuous(e) => write!(f, "headers are not continuous: {}", e),
            HeaderChainError::UnknownParent(h) => write!(f, "first header extends unknown block {}", hex::encode(h)),
            HeaderChainError::BadHeight { expected, got } => {
                write!(f, "first header has height {}, expected {}", got, expected)
            }
        }
    }
}

/// Result of connecting a header batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    pub appended: usize,
    /// Pending headers were dropped because the batch forks off earlier.
    pub dropped: usize,
}

#[derive(Debug)]
pub struct HeaderChain {
    /// Block known to the chain that the pending headers extend.
    anchor: ChainTip,
    entries: VecDeque<(Sha256Hash, BlockHeader)>,
    index: HashMap<Sha256Hash, u64>,
}

impl HeaderChain {
    pub fn new(anchor: ChainTip) -> Self {
        Self {
            anchor,
            entries: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    pub fn anchor(&self) -> ChainTip {
        self.anchor
    }

    /// Newest pending header, or the anchor when nothing is pending.
    pub fn tip(&self) -> ChainTip {
        self.entries
            .back()
            .map(|(hash, header)| ChainTip { hash: *hash, height: header.height })
            .unwrap_or(self.anchor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.index.contains_key(hash)
    }

    /// Forget every pending header and start over from `anchor`.
    pub fn reset(&mut self, anchor: ChainTip) {
        self.anchor = anchor;
        self.entries.clear();
        self.index.clear();
    }

    /// Pending headers in height order, at most `limit`.
    pub fn pending(&self, limit: usize) -> impl Iterator<Item = (&Sha256Hash, &BlockHeader)> {
        self.entries.iter().take(limit).map(|(hash, header)| (hash, header))
    }

    /// Append a batch received in answer to [`HeaderChain::locator`].
    ///
    /// The batch may extend the tip, fork off an earlier pending header, or
    /// fork off any block `in_chain` knows about; forks drop the pending
    /// headers past the fork point.
    pub fn connect(
        &mut self,
        batch: &[BlockHeader],
        in_chain: impl Fn(&Sha256Hash) -> bool,
    ) -> Result<Connected, HeaderChainError> {
        let Some(first) = batch.first() else {
            return Ok(Connected { appended: 0, dropped: 0 });
        };
        validate_header_sequence(batch).map_err(HeaderChainError::NotContinuous)?;

        let parent = first.previous_hash;
        let mut dropped = 0;
        if parent == self.tip().hash {
            // plain extension
        } else if let Some(&height) = self.index.get(&parent) {
            dropped = self.truncate_after_height(height);
        } else if parent == self.anchor.hash {
            dropped = self.entries.len();
            let anchor = self.anchor;
            self.reset(anchor);
        } else if in_chain(&parent) {
            dropped = self.entries.len();
            self.reset(ChainTip {
                hash: parent,
                height: first.height.saturating_sub(1),
            });
        } else {
            return Err(HeaderChainError::UnknownParent(parent));
        }

        let tip = self.tip();
        validate_header_linkage(first, &tip.hash, tip.height).map_err(|_| HeaderChainError::BadHeight {
            expected: tip.height.saturating_add(1),
            got: first.height,
        })?;

        for header in batch {
            let hash = header.hash();
            self.index.insert(hash, header.height);
            self.entries.push_back((hash, header.clone()));
        }

        Ok(Connected {
            appended: batch.len(),
            dropped,
        })
    }

    /// Locator starting at the newest pending header, dense for the most
    /// recent entries then exponentially sparse, always ending at the anchor.
    pub fn locator(&self) -> BlockLocator {
        let mut hashes = Vec::new();
        let mut step = 1usize;
        let mut idx = self.entries.len();
        while idx > 0 {
            hashes.push(self.entries[idx - 1].0);
            if hashes.len() >= LOCATOR_DENSE_PREFIX {
                step *= 2;
            }
            idx = idx.saturating_sub(step);
        }
        hashes.push(self.anchor.hash);
        BlockLocator(hashes)
    }

    /// Advance the anchor past every leading header the chain now holds.
    pub fn prune_applied(&mut self, in_chain: impl Fn(&Sha256Hash) -> bool) -> usize {
        let mut pruned = 0;
        while let Some((hash, header)) = self.entries.front() {
            if !in_chain(hash) {
                break;
            }
            self.anchor = ChainTip {
                hash: *hash,
                height: header.height,
            };
            self.index.remove(hash);
            self.entries.pop_front();
            pruned += 1;
        }
        pruned
    }

    /// Drop `hash` and every header after it.
    pub fn truncate_from(&mut self, hash: &Sha256Hash) -> usize {
        match self.index.get(hash) {
            Some(&height) => self.truncate_after_height(height.saturating_sub(1)),
            None => 0,
        }
    }

    fn truncate_after_height(&mut self, height: u64) -> usize {
        let keep = height.saturating_sub(self.anchor.height) as usize;
        let mut dropped = 0;
        while self.entries.len() > keep {
            if let Some((hash, _)) = self.entries.pop_back() {
                self.index.remove(&hash);
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Block;

    fn blocks_from(parent: &Block, count: usize, tag: u8) -> Vec<Block> {
        let mut out: Vec<Block> = Vec::new();
        for i in 0..count {
            let prev = out.last().unwrap_or(parent);
            out.push(Block::child_of(prev, vec![vec![tag, i as u8]]));
        }
        out
    }

    fn headers(blocks: &[Block]) -> Vec<BlockHeader> {
        blocks.iter().map(|b| b.header.clone()).collect()
    }

    fn genesis_tip() -> ChainTip {
        ChainTip {
            hash: Block::genesis().hash(),
            height: 0,
        }
    }

    #[test]
    fn test_connect_extends_tip() {
        let genesis = Block::genesis();
        let blocks = blocks_from(&genesis, 5, 0);
        let mut chain = HeaderChain::new(genesis_tip());

        let c = chain.connect(&headers(&blocks[..3]), |_| false).unwrap();
        assert_eq!(c, Connected { appended: 3, dropped: 0 });
        chain.connect(&headers(&blocks[3..]), |_| false).unwrap();

        assert_eq!(chain.len(), 5);
        assert_eq!(chain.tip().hash, blocks[4].hash());
        assert_eq!(chain.tip().height, 5);
    }

    #[test]
    fn test_connect_rejects_unknown_parent() {
        let genesis = Block::genesis();
        let blocks = blocks_from(&genesis, 4, 0);
        let mut chain = HeaderChain::new(genesis_tip());

        let err = chain.connect(&headers(&blocks[2..]), |_| false).unwrap_err();
        assert_eq!(err, HeaderChainError::UnknownParent(blocks[1].hash()));
        assert!(chain.is_empty());
    }

    #[test]
    fn test_connect_rejects_gap_inside_batch() {
        let genesis = Block::genesis();
        let blocks = blocks_from(&genesis, 4, 0);
        let mut chain = HeaderChain::new(genesis_tip());

        let batch = vec![blocks[0].header.clone(), blocks[2].header.clone()];
        assert!(matches!(
            chain.connect(&batch, |_| false),
            Err(HeaderChainError::NotContinuous(_))
        ));
    }

    #[test]
    fn test_fork_off_pending_header_truncates() {
        let genesis = Block::genesis();
        let main = blocks_from(&genesis, 5, 0);
        let fork = blocks_from(&main[1], 4, 1);
        let mut chain = HeaderChain::new(genesis_tip());

        chain.connect(&headers(&main), |_| false).unwrap();
        let c = chain.connect(&headers(&fork), |_| false).unwrap();

        assert_eq!(c, Connected { appended: 4, dropped: 3 });
        assert_eq!(chain.len(), 6);
        assert!(!chain.contains(&main[2].hash()));
        assert_eq!(chain.tip().hash, fork[3].hash());
    }

    #[test]
    fn test_fork_off_chain_block_reanchors() {
        let genesis = Block::genesis();
        let main = blocks_from(&genesis, 3, 0);
        let fork = blocks_from(&main[0], 3, 1);
        let mut chain = HeaderChain::new(ChainTip {
            hash: main[2].hash(),
            height: 3,
        });

        let known = main[0].hash();
        let c = chain.connect(&headers(&fork), |h| *h == known).unwrap();
        assert_eq!(c.appended, 3);
        assert_eq!(chain.anchor().hash, known);
        assert_eq!(chain.tip().height, 4);
    }

    #[test]
    fn test_locator_is_dense_then_sparse_and_ends_at_anchor() {
        let genesis = Block::genesis();
        let blocks = blocks_from(&genesis, 30, 0);
        let mut chain = HeaderChain::new(genesis_tip());
        chain.connect(&headers(&blocks), |_| false).unwrap();

        let locator = chain.locator();
        let hashes = locator.hashes();
        assert_eq!(locator.tip(), Some(&blocks[29].hash()));
        assert_eq!(hashes[9], blocks[20].hash());
        assert_eq!(hashes[10], blocks[18].hash());
        assert_eq!(*hashes.last().unwrap(), genesis.hash());
        assert!(hashes.len() < 20);
    }

    #[test]
    fn test_empty_locator_is_anchor() {
        let chain = HeaderChain::new(genesis_tip());
        assert_eq!(chain.locator(), BlockLocator(vec![Block::genesis().hash()]));
    }

    #[test]
    fn test_prune_applied_moves_anchor() {
        let genesis = Block::genesis();
        let blocks = blocks_from(&genesis, 4, 0);
        let mut chain = HeaderChain::new(genesis_tip());
        chain.connect(&headers(&blocks), |_| false).unwrap();

        let applied = [blocks[0].hash(), blocks[1].hash()];
        assert_eq!(chain.prune_applied(|h| applied.contains(h)), 2);
        assert_eq!(chain.anchor().hash, blocks[1].hash());
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_truncate_from() {
        let genesis = Block::genesis();
        let blocks = blocks_from(&genesis, 5, 0);
        let mut chain = HeaderChain::new(genesis_tip());
        chain.connect(&headers(&blocks), |_| false).unwrap();

        assert_eq!(chain.truncate_from(&blocks[2].hash()), 3);
        assert_eq!(chain.tip().hash, blocks[1].hash());
        assert_eq!(chain.truncate_from(&[7u8; 32]), 0);
    }
}
