//! Per-peer sync bookkeeping and the request ledger.

use crate::blockchain::Sha256Hash;
use crate::error::{Result, SyncError};
use crate::network::PeerId;
use lru::LruCache;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Identity of an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Block(Sha256Hash),
    /// Headers batch, identified by the newest locator hash it was asked for.
    Headers(Sha256Hash),
}

impl RequestKey {
    pub fn block_hash(&self) -> Option<Sha256Hash> {
        match self {
            RequestKey::Block(hash) => Some(*hash),
            RequestKey::Headers(_) => None,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestKey::Block(hash) => write!(f, "block {}", hex::encode(hash)),
            RequestKey::Headers(hash) => write!(f, "headers after {}", hex::encode(hash)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub peer: PeerId,
    pub sent_at: Instant,
    pub deadline: Instant,
}

/// Peer sync information
#[derive(Debug)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Height the peer claimed at handshake.
    pub negotiated_height: u64,
    /// Highest height the peer has claimed or proven since.
    pub best_height: u64,
    /// Connection order; lower connected earlier.
    pub connected_seq: u64,
    pub connected_at: Instant,
    pub last_block_time: Option<Instant>,
    pub blocks_received: u64,
    pub is_sync_candidate: bool,
    pub stalls: u32,
    pub rejects: u32,
    disqualified: bool,
    requested: HashSet<RequestKey>,
    no_retry: LruCache<Sha256Hash, ()>,
}

impl PeerRecord {
    fn new(id: PeerId, height: u64, seq: u64, candidate: bool, no_retry_capacity: usize, now: Instant) -> Self {
        let capacity = NonZeroUsize::new(no_retry_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            id,
            negotiated_height: height,
            best_height: height,
            connected_seq: seq,
            connected_at: now,
            last_block_time: None,
            blocks_received: 0,
            is_sync_candidate: candidate,
            stalls: 0,
            rejects: 0,
            disqualified: false,
            requested: HashSet::new(),
            no_retry: LruCache::new(capacity),
        }
    }

    /// Outstanding block requests.
    pub fn blocks_in_flight(&self) -> usize {
        self.requested
            .iter()
            .filter(|key| matches!(key, RequestKey::Block(_)))
            .count()
    }

    pub fn has_requested(&self, key: &RequestKey) -> bool {
        self.requested.contains(key)
    }

    /// Whether this peer already failed to deliver `hash`.
    pub fn refuses(&self, hash: &Sha256Hash) -> bool {
        self.no_retry.contains(hash)
    }

    pub fn is_disqualified(&self) -> bool {
        self.disqualified
    }
}

/// Connected peers plus the ledger of everything requested from them.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
    ledger: HashMap<RequestKey, PendingRequest>,
    next_seq: u64,
    max_stalls: u32,
    max_rejects: u32,
    no_retry_capacity: usize,
}

impl PeerTable {
    pub fn new(max_stalls: u32, max_rejects: u32, no_retry_capacity: usize) -> Self {
        Self {
            peers: HashMap::new(),
            ledger: HashMap::new(),
            next_seq: 0,
            max_stalls,
            max_rejects,
            no_retry_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn get(&self, peer: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(&peer)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn candidate_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_sync_candidate).count()
    }

    /// Register a new connection. Returns false if `peer` is already known.
    pub fn on_peer_connected(
        &mut self,
        peer: PeerId,
        negotiated_height: u64,
        local_height: u64,
        margin: u64,
        now: Instant,
    ) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        let candidate = negotiated_height >= local_height.saturating_add(margin);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.peers.insert(
            peer,
            PeerRecord::new(peer, negotiated_height, seq, candidate, self.no_retry_capacity, now),
        );
        true
    }

    /// Remove `peer` and release everything it still owed us.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) -> Option<(PeerRecord, Vec<RequestKey>)> {
        let record = self.peers.remove(&peer)?;
        let released: Vec<RequestKey> = record.requested.iter().copied().collect();
        for key in &released {
            self.ledger.remove(key);
        }
        Some((record, released))
    }

    /// Record that `key` was requested from `peer`.
    ///
    /// A key may be outstanding to at most one peer; a second request is a
    /// scheduling bug and is reported as [`SyncError::DuplicateRequest`].
    pub fn record_request_sent(&mut self, peer: PeerId, key: RequestKey, now: Instant, timeout: Duration) -> Result<()> {
        if let Some(existing) = self.ledger.get(&key) {
            return Err(SyncError::DuplicateRequest {
                what: key.to_string(),
                existing: existing.peer,
                attempted: peer,
            });
        }
        self.ledger.insert(
            key,
            PendingRequest {
                peer,
                sent_at: now,
                deadline: now + timeout,
            },
        );
        if let Some(record) = self.peers.get_mut(&peer) {
            record.requested.insert(key);
        }
        Ok(())
    }

    /// Clear `key` if it is outstanding to `peer`. Returns false when no such
    /// request exists, which marks the response as unsolicited.
    pub fn record_response_received(&mut self, peer: PeerId, key: &RequestKey) -> bool {
        let owned = self.ledger.get(key).map_or(false, |pending| pending.peer == peer);
        if !owned {
            return false;
        }
        self.ledger.remove(key);
        if let Some(record) = self.peers.get_mut(&peer) {
            record.requested.remove(key);
        }
        true
    }

    pub fn is_requested(&self, key: &RequestKey) -> bool {
        self.ledger.contains_key(key)
    }

    pub fn pending(&self, key: &RequestKey) -> Option<&PendingRequest> {
        self.ledger.get(key)
    }

    /// The outstanding headers request to `peer`, if any.
    pub fn headers_request_to(&self, peer: PeerId) -> Option<RequestKey> {
        self.peers.get(&peer).and_then(|record| {
            record
                .requested
                .iter()
                .find(|key| matches!(key, RequestKey::Headers(_)))
                .copied()
        })
    }

    pub fn headers_in_flight(&self) -> bool {
        self.ledger.keys().any(|key| matches!(key, RequestKey::Headers(_)))
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.ledger
            .keys()
            .filter(|key| matches!(key, RequestKey::Block(_)))
            .count()
    }

    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    /// Remove and return every request whose deadline has passed.
    pub fn stalled(&mut self, now: Instant) -> Vec<(RequestKey, PendingRequest)> {
        let expired: Vec<RequestKey> = self
            .ledger
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| *key)
            .collect();

        let mut stalled = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(pending) = self.ledger.remove(&key) {
                if let Some(record) = self.peers.get_mut(&pending.peer) {
                    record.requested.remove(&key);
                }
                stalled.push((key, pending));
            }
        }
        stalled.sort_by_key(|(_, pending)| pending.sent_at);
        stalled
    }

    /// Count a missed deadline against `peer`. Returns true if this pushed
    /// the peer out of sync candidacy.
    pub fn note_stall(&mut self, peer: PeerId, hash: Option<Sha256Hash>) -> bool {
        let max_stalls = self.max_stalls;
        let Some(record) = self.peers.get_mut(&peer) else {
            return false;
        };
        record.stalls += 1;
        if let Some(hash) = hash {
            record.no_retry.put(hash, ());
        }
        let exceeded = record.stalls >= max_stalls;
        Self::disqualify_if(record, exceeded)
    }

    /// Count a rejected or invalid delivery against `peer`. Returns true if
    /// this pushed the peer out of sync candidacy.
    pub fn note_reject(&mut self, peer: PeerId, hash: Option<Sha256Hash>) -> bool {
        let max_rejects = self.max_rejects;
        let Some(record) = self.peers.get_mut(&peer) else {
            return false;
        };
        record.rejects += 1;
        if let Some(hash) = hash {
            record.no_retry.put(hash, ());
        }
        let exceeded = record.rejects >= max_rejects;
        Self::disqualify_if(record, exceeded)
    }

    /// `peer` does not have `hash`; ask someone else without penalty.
    pub fn note_refusal(&mut self, peer: PeerId, hash: Sha256Hash) {
        if let Some(record) = self.peers.get_mut(&peer) {
            record.no_retry.put(hash, ());
        }
    }

    /// Promote peers that have pulled ahead of the local chain.
    pub fn refresh_candidates(&mut self, local_height: u64, margin: u64) -> Vec<PeerId> {
        let threshold = local_height.saturating_add(margin);
        let mut promoted = Vec::new();
        for record in self.peers.values_mut() {
            if !record.is_sync_candidate && !record.disqualified && record.best_height >= threshold {
                record.is_sync_candidate = true;
                promoted.push(record.id);
            }
        }
        promoted
    }

    /// Pick the sync peer: highest best height, ties to the earliest
    /// connection.
    pub fn best_sync_candidate(&self) -> Option<PeerId> {
        self.peers
            .values()
            .filter(|p| p.is_sync_candidate)
            .max_by(|a, b| {
                a.best_height
                    .cmp(&b.best_height)
                    .then_with(|| b.connected_seq.cmp(&a.connected_seq))
            })
            .map(|p| p.id)
    }

    fn disqualify_if(record: &mut PeerRecord, exceeded: bool) -> bool {
        if exceeded && !record.disqualified {
            record.disqualified = true;
            record.is_sync_candidate = false;
            return true;
        }
        false
    }

    /// Every ledger entry belongs to a known peer's request set and no key is
    /// owned by two peers.
    #[cfg(test)]
    pub(crate) fn ledger_is_consistent(&self) -> bool {
        let mut seen = HashSet::new();
        for record in self.peers.values() {
            for key in &record.requested {
                if !seen.insert(*key) {
                    return false;
                }
                match self.ledger.get(key) {
                    Some(pending) if pending.peer == record.id => {}
                    _ => return false,
                }
            }
        }
        seen.len() == self.ledger.len()
    }
}
