//! Chooses what to request next and from whom.

use super::headers::HeaderChain;
use super::peer_state::{PeerTable, RequestKey};
use super::SyncPhase;
use crate::blockchain::Sha256Hash;
use crate::network::{BlockLocator, PeerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Headers { peer: PeerId, locator: BlockLocator },
    Block { peer: PeerId, hash: Sha256Hash },
}

impl Request {
    pub fn peer(&self) -> PeerId {
        match self {
            Request::Headers { peer, .. } | Request::Block { peer, .. } => *peer,
        }
    }

    /// Ledger key this request is tracked under.
    pub fn key(&self) -> RequestKey {
        match self {
            Request::Headers { locator, .. } => RequestKey::Headers(locator.tip().copied().unwrap_or([0u8; 32])),
            Request::Block { hash, .. } => RequestKey::Block(*hash),
        }
    }
}

/// Everything the scheduler looks at. `have` answers whether a block is
/// already in the chain, queued for application, orphaned or known invalid.
pub struct ScheduleContext<'a> {
    pub phase: SyncPhase,
    pub sync_peer: Option<PeerId>,
    pub peers: &'a PeerTable,
    pub headers: &'a HeaderChain,
    pub have: &'a dyn Fn(&Sha256Hash) -> bool,
}

#[derive(Debug, Clone)]
pub struct DownloadScheduler {
    max_in_flight_per_peer: usize,
    max_blocks_in_flight: usize,
    download_window: usize,
}

struct PeerLoad {
    id: PeerId,
    in_flight: usize,
    connected_seq: u64,
    best_height: u64,
}

impl DownloadScheduler {
    pub fn new(max_in_flight_per_peer: usize, max_blocks_in_flight: usize, download_window: usize) -> Self {
        Self {
            max_in_flight_per_peer,
            max_blocks_in_flight,
            download_window,
        }
    }

    pub fn max_in_flight_per_peer(&self) -> usize {
        self.max_in_flight_per_peer
    }

    /// Requests to issue now to keep the pipeline full. Never returns a key
    /// that is already in flight, and never the same key twice.
    pub fn next_requests(&self, ctx: &ScheduleContext<'_>) -> Vec<Request> {
        match ctx.phase {
            SyncPhase::Idle => Vec::new(),
            SyncPhase::HeadersSync => self.header_request(ctx).into_iter().collect(),
            SyncPhase::BlocksSync | SyncPhase::Current => self.block_requests(ctx),
        }
    }

    fn header_request(&self, ctx: &ScheduleContext<'_>) -> Option<Request> {
        let peer = ctx.sync_peer?;
        if ctx.peers.headers_in_flight() || !ctx.peers.contains(peer) {
            return None;
        }
        Some(Request::Headers {
            peer,
            locator: ctx.headers.locator(),
        })
    }

    fn block_requests(&self, ctx: &ScheduleContext<'_>) -> Vec<Request> {
        let mut budget = self
            .max_blocks_in_flight
            .saturating_sub(ctx.peers.blocks_in_flight());
        let mut loads: Vec<PeerLoad> = ctx
            .peers
            .iter()
            .filter(|p| p.is_sync_candidate)
            .map(|p| PeerLoad {
                id: p.id,
                in_flight: p.blocks_in_flight(),
                connected_seq: p.connected_seq,
                best_height: p.best_height,
            })
            .collect();

        let mut requests = Vec::new();
        for (hash, header) in ctx.headers.pending(self.download_window) {
            if budget == 0 || loads.iter().all(|l| l.in_flight >= self.max_in_flight_per_peer) {
                break;
            }
            if ctx.peers.is_requested(&RequestKey::Block(*hash)) || (ctx.have)(hash) {
                continue;
            }

            let chosen = loads
                .iter_mut()
                .filter(|l| l.in_flight < self.max_in_flight_per_peer && l.best_height >= header.height)
                .filter(|l| ctx.peers.get(l.id).map_or(false, |p| !p.refuses(hash)))
                .min_by_key(|l| (l.in_flight, l.connected_seq));

            if let Some(load) = chosen {
                load.in_flight += 1;
                budget -= 1;
                requests.push(Request::Block {
                    peer: load.id,
                    hash: *hash,
                });
            }
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{Block, BlockHeader, ChainTip};
    use std::time::{Duration, Instant};

    fn header_chain(count: usize) -> (HeaderChain, Vec<Block>) {
        let genesis = Block::genesis();
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..count {
            let prev = blocks.last().unwrap_or(&genesis);
            blocks.push(Block::child_of(prev, vec![vec![i as u8]]));
        }
        let mut chain = HeaderChain::new(ChainTip {
            hash: genesis.hash(),
            height: 0,
        });
        let headers: Vec<BlockHeader> = blocks.iter().map(|b| b.header.clone()).collect();
        chain.connect(&headers, |_| false).unwrap();
        (chain, blocks)
    }

    fn nothing(_: &Sha256Hash) -> bool {
        false
    }

    fn peers_with(heights: &[(u64, u64)]) -> PeerTable {
        let mut peers = PeerTable::new(3, 3, 16);
        let now = Instant::now();
        for &(id, height) in heights {
            peers.on_peer_connected(PeerId(id), height, 0, 1, now);
        }
        peers
    }

    #[test]
    fn test_idle_requests_nothing() {
        let (headers, _) = header_chain(5);
        let peers = peers_with(&[(1, 10)]);
        let scheduler = DownloadScheduler::new(4, 100, 100);
        let ctx = ScheduleContext {
            phase: SyncPhase::Idle,
            sync_peer: Some(PeerId(1)),
            peers: &peers,
            headers: &headers,
            have: &nothing,
        };
        assert!(scheduler.next_requests(&ctx).is_empty());
    }

    #[test]
    fn test_headers_only_go_to_sync_peer_one_at_a_time() {
        let (headers, blocks) = header_chain(3);
        let mut peers = peers_with(&[(1, 10), (2, 10)]);
        let scheduler = DownloadScheduler::new(4, 100, 100);

        let requests = {
            let ctx = ScheduleContext {
                phase: SyncPhase::HeadersSync,
                sync_peer: Some(PeerId(2)),
                peers: &peers,
                headers: &headers,
                have: &nothing,
            };
            scheduler.next_requests(&ctx)
        };
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].peer(), PeerId(2));
        assert_eq!(requests[0].key(), RequestKey::Headers(blocks[2].hash()));

        peers
            .record_request_sent(PeerId(2), requests[0].key(), Instant::now(), Duration::from_secs(5))
            .unwrap();
        let ctx = ScheduleContext {
            phase: SyncPhase::HeadersSync,
            sync_peer: Some(PeerId(2)),
            peers: &peers,
            headers: &headers,
            have: &nothing,
        };
        assert!(scheduler.next_requests(&ctx).is_empty());
    }

    #[test]
    fn test_blocks_spread_by_fewest_outstanding_then_earliest_connection() {
        let (headers, blocks) = header_chain(5);
        let peers = peers_with(&[(7, 10), (3, 10)]);
        let scheduler = DownloadScheduler::new(4, 100, 100);
        let ctx = ScheduleContext {
            phase: SyncPhase::BlocksSync,
            sync_peer: Some(PeerId(7)),
            peers: &peers,
            headers: &headers,
            have: &nothing,
        };

        let requests = scheduler.next_requests(&ctx);
        let assigned: Vec<(PeerId, Sha256Hash)> = requests
            .iter()
            .map(|r| match r {
                Request::Block { peer, hash } => (*peer, *hash),
                Request::Headers { .. } => panic!("unexpected headers request"),
            })
            .collect();

        // Peer 7 connected first, so it wins every tie.
        assert_eq!(
            assigned,
            vec![
                (PeerId(7), blocks[0].hash()),
                (PeerId(3), blocks[1].hash()),
                (PeerId(7), blocks[2].hash()),
                (PeerId(3), blocks[3].hash()),
                (PeerId(7), blocks[4].hash()),
            ]
        );
    }

    #[test]
    fn test_per_peer_limit_and_skips() {
        let (headers, blocks) = header_chain(10);
        let mut peers = peers_with(&[(1, 10)]);
        let now = Instant::now();
        peers
            .record_request_sent(PeerId(1), RequestKey::Block(blocks[0].hash()), now, Duration::from_secs(5))
            .unwrap();
        let already = blocks[1].hash();
        let have = move |h: &Sha256Hash| *h == already;
        let scheduler = DownloadScheduler::new(3, 100, 100);
        let ctx = ScheduleContext {
            phase: SyncPhase::BlocksSync,
            sync_peer: Some(PeerId(1)),
            peers: &peers,
            headers: &headers,
            have: &have,
        };

        let requests = scheduler.next_requests(&ctx);
        let hashes: Vec<RequestKey> = requests.iter().map(|r| r.key()).collect();
        assert_eq!(
            hashes,
            vec![RequestKey::Block(blocks[2].hash()), RequestKey::Block(blocks[3].hash())]
        );
    }

    #[test]
    fn test_non_candidates_short_peers_and_refusals_are_skipped() {
        let (headers, blocks) = header_chain(4);
        let mut peers = PeerTable::new(3, 3, 16);
        let now = Instant::now();
        peers.on_peer_connected(PeerId(1), 2, 0, 1, now);
        peers.on_peer_connected(PeerId(2), 50, 100, 1, now);
        peers.on_peer_connected(PeerId(3), 10, 0, 1, now);
        peers.note_refusal(PeerId(3), blocks[0].hash());

        let scheduler = DownloadScheduler::new(10, 100, 100);
        let ctx = ScheduleContext {
            phase: SyncPhase::BlocksSync,
            sync_peer: Some(PeerId(1)),
            peers: &peers,
            headers: &headers,
            have: &nothing,
        };
        let requests = scheduler.next_requests(&ctx);

        assert!(requests.iter().all(|r| r.peer() != PeerId(2)));
        assert!(requests.contains(&Request::Block { peer: PeerId(1), hash: blocks[0].hash() }));
        // Heights 3 and 4 are beyond peer 1's height.
        assert!(requests.contains(&Request::Block { peer: PeerId(3), hash: blocks[2].hash() }));
        assert!(requests.contains(&Request::Block { peer: PeerId(3), hash: blocks[3].hash() }));
    }

    #[test]
    fn test_global_budget_and_window() {
        let (headers, _) = header_chain(20);
        let peers = peers_with(&[(1, 100), (2, 100)]);

        let ctx = ScheduleContext {
            phase: SyncPhase::BlocksSync,
            sync_peer: Some(PeerId(1)),
            peers: &peers,
            headers: &headers,
            have: &nothing,
        };
        assert_eq!(DownloadScheduler::new(10, 5, 100).next_requests(&ctx).len(), 5);
        assert_eq!(DownloadScheduler::new(10, 100, 3).next_requests(&ctx).len(), 3);
    }
}
