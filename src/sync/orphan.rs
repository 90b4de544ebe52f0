//! Blocks whose parent is not yet known.
//!
//! Orphans live in a flat map keyed by their own hash with a secondary index
//! by parent hash, so resolving a chain of orphans is a sequence of map
//! lookups rather than a walk over linked nodes.

use crate::blockchain::{Block, Sha256Hash};
use crate::network::PeerId;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct OrphanBlock {
    pub block: Block,
    /// Peer that delivered the block, if any.
    pub source: Option<PeerId>,
    pub received_at: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct OrphanPool {
    orphans: HashMap<Sha256Hash, OrphanBlock>,
    by_parent: HashMap<Sha256Hash, Vec<Sha256Hash>>,
    /// Insertion sequence -> hash, oldest first.
    arrival: BTreeMap<u64, Sha256Hash>,
    next_seq: u64,
    max_orphans: usize,
}

impl OrphanPool {
    pub fn new(max_orphans: usize) -> Self {
        Self {
            orphans: HashMap::new(),
            by_parent: HashMap::new(),
            arrival: BTreeMap::new(),
            next_seq: 0,
            max_orphans,
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.orphans.contains_key(hash)
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<&OrphanBlock> {
        self.orphans.get(hash)
    }

    /// Insert `block`, evicting the oldest orphans first when the pool is
    /// full. Returns false for duplicates or a zero-capacity pool.
    pub fn add(&mut self, block: Block, source: Option<PeerId>, now: Instant) -> bool {
        let hash = block.hash();
        if self.max_orphans == 0 || self.orphans.contains_key(&hash) {
            return false;
        }

        while self.orphans.len() >= self.max_orphans {
            if self.evict_oldest().is_none() {
                break;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_parent
            .entry(block.parent_hash())
            .or_default()
            .push(hash);
        self.arrival.insert(seq, hash);
        self.orphans.insert(
            hash,
            OrphanBlock {
                block,
                source,
                received_at: now,
                seq,
            },
        );
        true
    }

    /// Remove and return every orphan whose parent is `parent`, oldest first.
    pub fn resolve(&mut self, parent: &Sha256Hash) -> Vec<OrphanBlock> {
        let Some(children) = self.by_parent.remove(parent) else {
            return Vec::new();
        };

        let mut resolved: Vec<OrphanBlock> = children
            .into_iter()
            .filter_map(|hash| {
                let orphan = self.orphans.remove(&hash)?;
                self.arrival.remove(&orphan.seq);
                Some(orphan)
            })
            .collect();
        resolved.sort_by_key(|o| o.seq);
        resolved
    }

    /// Drop orphans that have waited longer than `age`.
    pub fn evict_older_than(&mut self, age: Duration, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((_, hash)) = self.arrival.first_key_value() {
            let expired = self
                .orphans
                .get(hash)
                .map_or(true, |o| now.saturating_duration_since(o.received_at) > age);
            if !expired {
                break;
            }
            if self.evict_oldest().is_some() {
                evicted += 1;
            }
        }
        evicted
    }

    /// Walk up through orphaned ancestors of `hash` and return the oldest one
    /// still in the pool. Its parent is the block that is actually missing.
    pub fn orphan_root(&self, hash: &Sha256Hash) -> Sha256Hash {
        let mut root = *hash;
        for _ in 0..self.orphans.len() {
            let Some(orphan) = self.orphans.get(&root) else {
                break;
            };
            let parent = orphan.block.parent_hash();
            if !self.orphans.contains_key(&parent) {
                break;
            }
            root = parent;
        }
        root
    }

    /// Remove every orphan descending from `hash`. Returns how many were
    /// dropped.
    pub fn remove_descendants(&mut self, hash: &Sha256Hash) -> usize {
        let mut removed = 0;
        let mut queue = VecDeque::from([*hash]);
        while let Some(parent) = queue.pop_front() {
            for child in self.resolve(&parent) {
                queue.push_back(child.block.hash());
                removed += 1;
            }
        }
        removed
    }

    fn evict_oldest(&mut self) -> Option<Sha256Hash> {
        let (_, hash) = self.arrival.pop_first()?;
        let orphan = self.orphans.remove(&hash)?;
        let parent = orphan.block.parent_hash();
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| *h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(hash)
    }
}
