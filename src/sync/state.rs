//! Sync state machine.
//!
//! [`SyncState`] owns every piece of mutable sync state: the peer table and
//! request ledger, the orphan pool, the pending header chain, the apply queue
//! and the phase. Each `on_*` handler processes one event to completion and
//! queues the resulting side effects as [`SyncAction`]s, which the dispatcher
//! drains with [`SyncState::take_actions`]. Nothing here blocks or does I/O
//! apart from read-only queries against the chain.

use super::applier::ApplyOutcome;
use super::event::SyncAction;
use super::headers::HeaderChain;
use super::orphan::OrphanPool;
use super::peer_state::{PeerTable, RequestKey};
use super::progress::ProgressLogger;
use super::scheduler::{DownloadScheduler, Request, ScheduleContext};
use super::{SyncPeerInfo, SyncPhase, SyncStatus};
use crate::blockchain::{Block, BlockHeader, Chain, Sha256Hash};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::network::PeerId;
use lru::LruCache;
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct QueuedBlock {
    hash: Sha256Hash,
    block: Block,
    source: Option<PeerId>,
}

pub struct SyncState {
    config: SyncConfig,
    chain: Arc<dyn Chain>,
    phase: SyncPhase,
    sync_peer: Option<PeerId>,
    peers: PeerTable,
    orphans: OrphanPool,
    headers: HeaderChain,
    scheduler: DownloadScheduler,
    /// Blocks whose parent is in the chain or ahead of them in this queue.
    apply_queue: VecDeque<QueuedBlock>,
    /// Hashes in `apply_queue` plus the one being applied.
    pending_apply: HashSet<Sha256Hash>,
    applying: Option<QueuedBlock>,
    recently_rejected: LruCache<Sha256Hash, ()>,
    progress: ProgressLogger,
    blocks_applied: u64,
    actions: Vec<SyncAction>,
    shutting_down: bool,
}

impl SyncState {
    pub fn new(config: SyncConfig, chain: Arc<dyn Chain>) -> Self {
        let rejected_capacity = NonZeroUsize::new(config.rejected_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            phase: SyncPhase::Idle,
            sync_peer: None,
            peers: PeerTable::new(config.max_stalls, config.max_rejects, config.no_retry_capacity),
            orphans: OrphanPool::new(config.max_orphans),
            headers: HeaderChain::new(chain.current_tip()),
            scheduler: DownloadScheduler::new(
                config.max_in_flight_per_peer,
                config.max_blocks_in_flight,
                config.download_window,
            ),
            apply_queue: VecDeque::new(),
            pending_apply: HashSet::new(),
            applying: None,
            recently_rejected: LruCache::new(rejected_capacity),
            progress: ProgressLogger::new(config.progress_log_interval()),
            blocks_applied: 0,
            actions: Vec::new(),
            shutting_down: false,
            chain,
            config,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    pub fn sync_peer_info(&self) -> Option<SyncPeerInfo> {
        let record = self.peers.get(self.sync_peer?)?;
        Some(SyncPeerInfo {
            peer: record.id,
            negotiated_height: record.negotiated_height,
            best_height: record.best_height,
        })
    }

    pub fn is_current(&self) -> bool {
        self.phase == SyncPhase::Current
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn orphans(&self) -> &OrphanPool {
        &self.orphans
    }

    pub fn headers(&self) -> &HeaderChain {
        &self.headers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn local_height(&self) -> u64 {
        self.chain.current_tip().height
    }

    /// Drain the side effects queued by the handlers so far.
    pub fn take_actions(&mut self) -> Vec<SyncAction> {
        std::mem::take(&mut self.actions)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            phase: self.phase,
            sync_peer: self.sync_peer_info(),
            local_height: self.local_height(),
            peer_count: self.peers.len(),
            candidate_count: self.peers.candidate_count(),
            pending_headers: self.headers.len(),
            orphan_count: self.orphans.len(),
            requests_in_flight: self.peers.in_flight(),
            blocks_applied: self.blocks_applied,
        }
    }

    pub fn on_peer_connected(&mut self, peer: PeerId, height: u64, now: Instant) -> Result<()> {
        let local = self.local_height();
        if !self
            .peers
            .on_peer_connected(peer, height, local, self.config.candidate_height_margin, now)
        {
            warn!(%peer, "Ignoring duplicate connection announcement");
            return self.finish(now);
        }
        let candidate = self.peers.get(peer).map_or(false, |p| p.is_sync_candidate);
        info!(%peer, height, local_height = local, candidate, "Peer connected");
        self.finish(now)
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId, now: Instant) -> Result<()> {
        self.remove_peer(peer);
        self.finish(now)
    }

    pub fn on_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>, now: Instant) -> Result<()> {
        let Some(key) = self.peers.headers_request_to(peer) else {
            debug!(%peer, count = headers.len(), "Discarding unsolicited headers");
            return self.finish(now);
        };
        self.peers.record_response_received(peer, &key);

        if self.sync_peer != Some(peer) || self.phase != SyncPhase::HeadersSync {
            debug!(%peer, "Discarding headers from a peer that is no longer the sync peer");
            return self.finish(now);
        }

        if headers.len() > self.config.max_headers_per_batch {
            let reason = format!(
                "sent {} headers, limit is {}",
                headers.len(),
                self.config.max_headers_per_batch
            );
            self.protocol_violation(peer, reason);
            return self.finish(now);
        }

        if headers.is_empty() {
            // The peer has nothing past our header tip, whatever height it claimed.
            let served = self.headers.tip().height;
            if let Some(record) = self.peers.get_mut(peer) {
                if record.best_height != served {
                    debug!(%peer, claimed = record.best_height, served, "Correcting sync peer height");
                    record.best_height = served;
                }
            }
            info!(
                %peer,
                header_height = served,
                pending = self.headers.len(),
                "Headers sync complete, downloading blocks"
            );
            self.phase = SyncPhase::BlocksSync;
            return self.finish(now);
        }

        let chain = Arc::clone(&self.chain);
        match self.headers.connect(&headers, |h| chain.has_block(h)) {
            Ok(connected) => {
                self.headers.prune_applied(|h| chain.has_block(h));
                let tip = self.headers.tip();
                if let Some(record) = self.peers.get_mut(peer) {
                    record.best_height = record.best_height.max(tip.height);
                }
                if connected.dropped > 0 {
                    info!(%peer, dropped = connected.dropped, "Sync peer follows another branch, dropped pending headers");
                }
                debug!(%peer, appended = connected.appended, header_height = tip.height, "Received headers");
            }
            Err(e) => self.protocol_violation(peer, e.to_string()),
        }
        self.finish(now)
    }

    pub fn on_block(&mut self, peer: PeerId, block: Block, now: Instant) -> Result<()> {
        let hash = block.hash();
        let solicited = self.peers.record_response_received(peer, &RequestKey::Block(hash));
        if !solicited && (self.phase != SyncPhase::Current || !self.peers.contains(peer)) {
            debug!(%peer, hash = %hex::encode(hash), "Discarding unsolicited block");
            return self.finish(now);
        }

        if let Some(record) = self.peers.get_mut(peer) {
            record.last_block_time = Some(now);
            record.blocks_received += 1;
            record.best_height = record.best_height.max(block.height());
        }

        let parent = block.parent_hash();
        if self.recently_rejected.contains(&hash) || self.recently_rejected.contains(&parent) {
            debug!(%peer, hash = %hex::encode(hash), "Ignoring block on a rejected branch");
            self.recently_rejected.put(hash, ());
            return self.finish(now);
        }

        if self.have_block(&hash) {
            debug!(%peer, hash = %hex::encode(hash), "Already have block");
            return self.finish(now);
        }

        if self.chain.has_block(&parent) || self.pending_apply.contains(&parent) {
            self.enqueue_for_apply(block, Some(peer));
        } else {
            let height = block.height();
            if self.orphans.add(block, Some(peer), now) {
                debug!(%peer, height, orphans = self.orphans.len(), "Stored orphan block");
            }
            if self.phase == SyncPhase::Current {
                self.request_missing_ancestor(peer, &hash, now)?;
            }
        }
        self.finish(now)
    }

    pub fn on_block_rejected(&mut self, peer: PeerId, hash: Sha256Hash, reason: &str, now: Instant) -> Result<()> {
        let solicited = self.peers.record_response_received(peer, &RequestKey::Block(hash));
        warn!(%peer, hash = %hex::encode(hash), %reason, solicited, "Peer rejected block request");
        if self.peers.note_reject(peer, Some(hash)) {
            self.on_disqualified(peer);
        }
        self.finish(now)
    }

    pub fn on_not_found(&mut self, peer: PeerId, hashes: Vec<Sha256Hash>, now: Instant) -> Result<()> {
        for hash in hashes {
            if self.peers.record_response_received(peer, &RequestKey::Block(hash)) {
                debug!(%peer, hash = %hex::encode(hash), "Peer does not have requested block");
            }
            self.peers.note_refusal(peer, hash);
        }
        self.finish(now)
    }

    pub fn on_inventory(&mut self, peer: PeerId, hashes: Vec<Sha256Hash>, now: Instant) -> Result<()> {
        if !self.peers.contains(peer) {
            return self.finish(now);
        }
        if self.phase != SyncPhase::Current {
            debug!(%peer, count = hashes.len(), "Ignoring inventory until sync is current");
            return self.finish(now);
        }
        for hash in hashes {
            self.request_block_from(peer, hash, now)?;
        }
        self.finish(now)
    }

    pub fn on_apply_completed(&mut self, hash: Sha256Hash, outcome: ApplyOutcome, now: Instant) -> Result<()> {
        let current = match self.applying.take() {
            Some(current) if current.hash == hash => current,
            other => {
                self.applying = other;
                warn!(hash = %hex::encode(hash), "Apply completion for a block that is not being applied");
                return self.finish(now);
            }
        };
        self.pending_apply.remove(&hash);

        let chain = Arc::clone(&self.chain);
        match outcome {
            ApplyOutcome::Applied { height } => {
                self.blocks_applied += 1;
                self.progress.log_block_height(height, now);
                self.headers.prune_applied(|h| chain.has_block(h));
            }
            ApplyOutcome::AlreadyHave => {
                self.headers.prune_applied(|h| chain.has_block(h));
            }
            ApplyOutcome::MissingParent => {
                debug!(hash = %hex::encode(hash), "Chain lacks the parent, returning block to the orphan pool");
                self.orphans.add(current.block, current.source, now);
            }
            ApplyOutcome::Rejected(reason) => {
                let err = SyncError::ChainRejected { hash, reason };
                warn!(peer = ?current.source, "{}", err);
                self.recently_rejected.put(hash, ());
                let dropped = self.discard_descendants(hash, true);
                self.headers.truncate_from(&hash);
                if dropped > 0 {
                    info!(dropped, "Discarded descendants of rejected block");
                }
                if let Some(peer) = current.source {
                    if self.peers.note_reject(peer, Some(hash)) {
                        self.on_disqualified(peer);
                    }
                }
            }
            ApplyOutcome::Failed(reason) => {
                error!(hash = %hex::encode(hash), %reason, "Chain failed to apply block");
                self.discard_descendants(hash, false);
            }
        }
        self.finish(now)
    }

    pub fn on_tick(&mut self, now: Instant) -> Result<()> {
        for (key, pending) in self.peers.stalled(now) {
            let err = SyncError::Stalled {
                peer: pending.peer,
                what: key.to_string(),
            };
            info!("{}, releasing for reassignment", err);
            if self.peers.note_stall(pending.peer, key.block_hash()) {
                self.on_disqualified(pending.peer);
            }
        }

        let evicted = self.orphans.evict_older_than(self.config.orphan_ttl(), now);
        if evicted > 0 {
            debug!(evicted, "Evicted expired orphans");
        }

        let local = self.local_height();
        for peer in self.peers.refresh_candidates(local, self.config.candidate_height_margin) {
            info!(%peer, "Peer is now a sync candidate");
        }

        self.evaluate_phase();
        self.finish(now)
    }

    /// Stop issuing work. Outstanding peer requests are abandoned and queued
    /// blocks dropped; a block already handed to the chain still reports back.
    pub fn on_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!(
            abandoned_requests = self.peers.in_flight(),
            queued_blocks = self.apply_queue.len(),
            "Sync shutting down"
        );
        self.apply_queue.clear();
        let applying = self.applying.as_ref().map(|q| q.hash);
        self.pending_apply.retain(|h| Some(*h) == applying);
    }

    fn finish(&mut self, now: Instant) -> Result<()> {
        if self.shutting_down {
            return Ok(());
        }
        self.ensure_sync_peer();
        self.maybe_start_apply();
        self.top_up(now)
    }

    fn ensure_sync_peer(&mut self) {
        if let Some(peer) = self.sync_peer {
            if self.peers.get(peer).map_or(false, |p| p.is_sync_candidate) {
                return;
            }
            self.sync_peer = None;
        }

        match self.peers.best_sync_candidate() {
            Some(peer) => {
                let height = self.peers.get(peer).map_or(0, |p| p.best_height);
                info!(%peer, height, phase = %self.phase, "Selected sync peer");
                self.sync_peer = Some(peer);
                if self.phase == SyncPhase::Idle {
                    self.start_headers_sync();
                }
            }
            None => {
                if self.phase != SyncPhase::Idle {
                    info!("No sync candidates left, sync is idle");
                    self.phase = SyncPhase::Idle;
                }
            }
        }
    }

    fn start_headers_sync(&mut self) {
        if self.headers.is_empty() {
            self.headers.reset(self.chain.current_tip());
        }
        self.phase = SyncPhase::HeadersSync;
    }

    fn evaluate_phase(&mut self) {
        if !matches!(self.phase, SyncPhase::BlocksSync | SyncPhase::Current) {
            return;
        }
        let Some(info) = self.sync_peer_info() else {
            return;
        };

        let chain = Arc::clone(&self.chain);
        self.headers.prune_applied(|h| chain.has_block(h));
        let pipeline_idle = self.headers.is_empty() && self.apply_queue.is_empty() && self.applying.is_none();
        if !pipeline_idle {
            return;
        }

        let local = self.local_height();
        if local >= info.best_height {
            if self.phase != SyncPhase::Current {
                info!(height = local, peer = %info.peer, "Chain is current with sync peer");
                self.phase = SyncPhase::Current;
            }
        } else {
            info!(
                local_height = local,
                peer_height = info.best_height,
                "Sync peer is ahead, resuming headers sync"
            );
            self.start_headers_sync();
        }
    }

    fn on_disqualified(&mut self, peer: PeerId) {
        warn!(%peer, "Peer disqualified as sync candidate");
        if let Some(key) = self.peers.headers_request_to(peer) {
            self.peers.record_response_received(peer, &key);
        }
        if self.sync_peer == Some(peer) {
            self.sync_peer = None;
        }
    }

    fn remove_peer(&mut self, peer: PeerId) {
        let Some((record, released)) = self.peers.on_peer_disconnected(peer) else {
            debug!(%peer, "Disconnect for unknown peer");
            return;
        };
        if self.sync_peer == Some(peer) {
            self.sync_peer = None;
            info!(%peer, "Lost sync peer");
        }
        info!(
            %peer,
            released = released.len(),
            blocks_received = record.blocks_received,
            "Peer disconnected"
        );
    }

    fn protocol_violation(&mut self, peer: PeerId, reason: String) {
        let err = SyncError::ProtocolViolation {
            peer,
            reason: reason.clone(),
        };
        warn!("{}, disconnecting", err);
        self.actions.push(SyncAction::DisconnectPeer { peer, reason });
        self.remove_peer(peer);
    }

    fn have_block(&self, hash: &Sha256Hash) -> bool {
        self.chain.has_block(hash) || self.pending_apply.contains(hash) || self.orphans.contains(hash)
    }

    /// Queue `block` and, iteratively, every orphan waiting on it.
    fn enqueue_for_apply(&mut self, block: Block, source: Option<PeerId>) {
        let mut work = VecDeque::from([(block, source)]);
        let mut resolved = 0usize;
        while let Some((block, source)) = work.pop_front() {
            let hash = block.hash();
            for orphan in self.orphans.resolve(&hash) {
                resolved += 1;
                work.push_back((orphan.block, orphan.source));
            }
            self.pending_apply.insert(hash);
            self.apply_queue.push_back(QueuedBlock { hash, block, source });
        }
        if resolved > 0 {
            debug!(resolved, "Orphans unblocked by new parent");
        }
    }

    fn maybe_start_apply(&mut self) {
        if self.shutting_down || self.applying.is_some() {
            return;
        }
        if let Some(next) = self.apply_queue.pop_front() {
            self.actions.push(SyncAction::ApplyBlock {
                block: next.block.clone(),
            });
            self.applying = Some(next);
        }
    }

    /// Drop queued and orphaned blocks that build on `hash`.
    fn discard_descendants(&mut self, hash: Sha256Hash, mark_rejected: bool) -> usize {
        let mut dropped = HashSet::from([hash]);
        let mut kept = VecDeque::with_capacity(self.apply_queue.len());
        for queued in self.apply_queue.drain(..) {
            if dropped.contains(&queued.block.parent_hash()) {
                dropped.insert(queued.hash);
            } else {
                kept.push_back(queued);
            }
        }
        self.apply_queue = kept;

        let mut count = dropped.len() - 1;
        for h in &dropped {
            self.pending_apply.remove(h);
            if mark_rejected {
                self.recently_rejected.put(*h, ());
            }
            count += self.orphans.remove_descendants(h);
        }
        count
    }

    fn request_missing_ancestor(&mut self, peer: PeerId, hash: &Sha256Hash, now: Instant) -> Result<()> {
        let root = self.orphans.orphan_root(hash);
        let Some(missing) = self.orphans.get(&root).map(|o| o.block.parent_hash()) else {
            return Ok(());
        };
        if self.request_block_from(peer, missing, now)? {
            debug!(%peer, missing = %hex::encode(missing), "Requested missing ancestor of orphan");
        }
        Ok(())
    }

    fn request_block_from(&mut self, peer: PeerId, hash: Sha256Hash, now: Instant) -> Result<bool> {
        let key = RequestKey::Block(hash);
        if self.have_block(&hash) || self.recently_rejected.contains(&hash) || self.peers.is_requested(&key) {
            return Ok(false);
        }
        let Some(record) = self.peers.get(peer) else {
            return Ok(false);
        };
        if record.blocks_in_flight() >= self.scheduler.max_in_flight_per_peer() || record.refuses(&hash) {
            return Ok(false);
        }
        self.peers
            .record_request_sent(peer, key, now, self.config.block_request_timeout())?;
        self.actions.push(SyncAction::RequestBlock { peer, hash });
        Ok(true)
    }

    /// Fill the request pipeline up to the configured limits.
    fn top_up(&mut self, now: Instant) -> Result<()> {
        let requests = {
            let chain = &self.chain;
            let pending = &self.pending_apply;
            let orphans = &self.orphans;
            let rejected = &self.recently_rejected;
            let have = |h: &Sha256Hash| {
                chain.has_block(h) || pending.contains(h) || orphans.contains(h) || rejected.contains(h)
            };
            let ctx = ScheduleContext {
                phase: self.phase,
                sync_peer: self.sync_peer,
                peers: &self.peers,
                headers: &self.headers,
                have: &have,
            };
            self.scheduler.next_requests(&ctx)
        };

        for request in requests {
            let key = request.key();
            let timeout = match request {
                Request::Headers { .. } => self.config.header_request_timeout(),
                Request::Block { .. } => self.config.block_request_timeout(),
            };
            self.peers.record_request_sent(request.peer(), key, now, timeout)?;
            match request {
                Request::Headers { peer, locator } => {
                    debug!(%peer, locator_len = locator.hashes().len(), "Requesting headers");
                    self.actions.push(SyncAction::RequestHeaders { peer, locator });
                }
                Request::Block { peer, hash } => {
                    self.actions.push(SyncAction::RequestBlock { peer, hash });
                }
            }
        }
        Ok(())
    }
}
