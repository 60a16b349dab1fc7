//! Rarest-first block scheduler
//!
//! All state lives behind one async mutex with short critical sections.
//! Selection is rarest-first with ties to the lowest index; until the first
//! piece verifies, new pieces are drawn uniformly from the four rarest so
//! peers do not all converge on the same opening piece. Once every missing
//! block has a request in flight the scheduler enters endgame and hands out
//! duplicates, cancelling the losers on first delivery.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::protocol::Bitfield;
use crate::scheduler::request::{BlockKey, BlockReceipt, BlockRequest, PieceResolution};
use crate::storage::BLOCK_SIZE;
use crate::torrent::Metainfo;

/// Tuning knobs for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Outstanding requests allowed per unchoked peer
    pub pipeline_depth: usize,
    /// Age after which an outstanding request is reassigned
    pub request_timeout: Duration,
    /// Rarest candidates drawn from until the first piece verifies
    pub early_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 5,
            request_timeout: Duration::from_secs(30),
            early_window: 4,
        }
    }
}

#[derive(Debug)]
struct PeerSlot {
    bitfield: Option<Bitfield>,
    choked: bool,
}

#[derive(Debug)]
struct PieceState {
    needed: bool,
    received: Vec<bool>,
    /// Per block: peers with this block in flight
    requested: Vec<HashSet<SocketAddr>>,
    contributors: HashSet<SocketAddr>,
}

impl PieceState {
    fn new(num_blocks: usize, needed: bool) -> Self {
        Self {
            needed,
            received: vec![false; num_blocks],
            requested: vec![HashSet::new(); num_blocks],
            contributors: HashSet::new(),
        }
    }

    fn reset(&mut self) {
        for r in &mut self.received {
            *r = false;
        }
        for set in &mut self.requested {
            set.clear();
        }
        self.contributors.clear();
    }

    fn is_fully_received(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

struct Inner {
    metainfo: Arc<Metainfo>,
    config: SchedulerConfig,
    have: Bitfield,
    pieces: Vec<PieceState>,
    peers: HashMap<SocketAddr, PeerSlot>,
    /// How many connected peers advertise each piece
    availability: Vec<u32>,
    outstanding: HashMap<(SocketAddr, BlockKey), Instant>,
    any_verified: bool,
}

/// The torrent's block scheduler
pub struct PieceScheduler {
    inner: Mutex<Inner>,
}

impl PieceScheduler {
    pub fn new(metainfo: Arc<Metainfo>, initial_have: Bitfield, config: SchedulerConfig) -> Self {
        let num_pieces = metainfo.num_pieces();
        let pieces = (0..num_pieces)
            .map(|i| {
                let num_blocks = metainfo.piece_len(i).div_ceil(BLOCK_SIZE) as usize;
                PieceState::new(num_blocks, !initial_have.has(i))
            })
            .collect();

        let any_verified = initial_have.count() > 0;
        Self {
            inner: Mutex::new(Inner {
                availability: vec![0; num_pieces as usize],
                have: initial_have,
                pieces,
                peers: HashMap::new(),
                outstanding: HashMap::new(),
                any_verified,
                metainfo,
                config,
            }),
        }
    }

    pub async fn register_peer(&self, peer: SocketAddr) {
        let mut inner = self.inner.lock().await;
        inner.peers.entry(peer).or_insert(PeerSlot {
            bitfield: None,
            choked: true,
        });
        trace!("Scheduler registered peer {}", peer);
    }

    /// Forget a peer and return its in-flight requests to the pool
    pub async fn drop_peer(&self, peer: SocketAddr) -> Vec<BlockRequest> {
        let mut inner = self.inner.lock().await;
        let reclaimed = inner.reclaim_outstanding(peer);
        if let Some(slot) = inner.peers.remove(&peer) {
            if let Some(bf) = slot.bitfield {
                for piece in bf.present() {
                    inner.availability[piece as usize] =
                        inner.availability[piece as usize].saturating_sub(1);
                }
            }
        }
        debug!("Dropped peer {} ({} requests reclaimed)", peer, reclaimed.len());
        reclaimed
    }

    /// Adopt a peer's full bitfield; returns whether it offers needed pieces
    pub async fn peer_bitfield(&self, peer: SocketAddr, bitfield: Bitfield) -> bool {
        let mut inner = self.inner.lock().await;
        for piece in bitfield.present() {
            inner.availability[piece as usize] += 1;
        }
        let interesting = bitfield.offers_piece_missing_from(&inner.have);
        if let Some(slot) = inner.peers.get_mut(&peer) {
            slot.bitfield = Some(bitfield);
        }
        interesting
    }

    /// Record a `have`; returns whether the piece is newly interesting
    pub async fn peer_has(&self, peer: SocketAddr, piece: u32) -> bool {
        let mut inner = self.inner.lock().await;
        if piece >= inner.metainfo.num_pieces() {
            warn!("Peer {} announced nonexistent piece {}", peer, piece);
            return false;
        }
        inner.availability[piece as usize] += 1;
        let interesting = !inner.have.has(piece);
        let num_pieces = inner.metainfo.num_pieces();
        if let Some(slot) = inner.peers.get_mut(&peer) {
            slot.bitfield
                .get_or_insert_with(|| Bitfield::new(num_pieces))
                .set(piece);
        }
        interesting
    }

    /// The peer choked us; all its requests go back to the pool
    pub async fn set_peer_choked(&self, peer: SocketAddr) -> Vec<BlockRequest> {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.peers.get_mut(&peer) {
            slot.choked = true;
        }
        let reclaimed = inner.reclaim_outstanding(peer);
        debug!("Peer {} choked us, reclaimed {} requests", peer, reclaimed.len());
        reclaimed
    }

    pub async fn set_peer_unchoked(&self, peer: SocketAddr) {
        let mut inner = self.inner.lock().await;
        if let Some(slot) = inner.peers.get_mut(&peer) {
            slot.choked = false;
        }
    }

    /// Fill the peer's pipeline up to the configured depth
    pub async fn next_requests(&self, peer: SocketAddr) -> Vec<BlockRequest> {
        let mut inner = self.inner.lock().await;
        inner.fill_pipeline(peer)
    }

    /// Report a delivered block
    ///
    /// A delivery only matches when its length equals the request's; a
    /// short or long payload leaves the request outstanding and the data
    /// is discarded.
    pub async fn block_received(
        &self,
        peer: SocketAddr,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> BlockReceipt {
        let mut inner = self.inner.lock().await;
        let key = BlockKey { piece, offset };

        let Some(&issued_at) = inner.outstanding.get(&(peer, key)) else {
            trace!("Unmatched block from {} (piece {}, offset {})", peer, piece, offset);
            return BlockReceipt::Unmatched;
        };

        let block = (offset / BLOCK_SIZE) as usize;
        if length != inner.block_len(piece, block) {
            trace!(
                "Wrong-length block from {} (piece {}, offset {}, length {})",
                peer,
                piece,
                offset,
                length
            );
            return BlockReceipt::Unmatched;
        }

        inner.outstanding.remove(&(peer, key));
        let elapsed = issued_at.elapsed();
        let state = &mut inner.pieces[piece as usize];
        state.received[block] = true;
        state.contributors.insert(peer);
        state.requested[block].remove(&peer);

        // Endgame losers: everyone else still assigned this block
        let losers: Vec<SocketAddr> = state.requested[block].drain().collect();
        let piece_complete = state.is_fully_received();

        let mut cancels = Vec::with_capacity(losers.len());
        for loser in losers {
            inner.outstanding.remove(&(loser, key));
            cancels.push((
                loser,
                BlockRequest {
                    piece,
                    offset,
                    length,
                },
            ));
        }

        BlockReceipt::Accepted {
            piece_complete,
            cancels,
            elapsed,
        }
    }

    /// Mark a piece verified; it leaves the needed set for good
    pub async fn piece_verified(&self, piece: u32) -> PieceResolution {
        let mut inner = self.inner.lock().await;
        inner.have.set(piece);
        inner.any_verified = true;

        let mut resolution = PieceResolution::default();
        // Cancel any endgame duplicates still in flight for this piece
        let stale: Vec<(SocketAddr, BlockKey)> = inner
            .outstanding
            .keys()
            .filter(|(_, key)| key.piece == piece)
            .copied()
            .collect();
        for (peer, key) in stale {
            inner.outstanding.remove(&(peer, key));
            let length = inner.block_len(piece, (key.offset / BLOCK_SIZE) as usize);
            resolution.cancels.push((
                peer,
                BlockRequest {
                    piece,
                    offset: key.offset,
                    length,
                },
            ));
        }

        let state = &mut inner.pieces[piece as usize];
        state.needed = false;
        resolution.contributors = state.contributors.drain().collect();
        for set in &mut state.requested {
            set.clear();
        }

        debug!("Piece {} verified ({} contributors)", piece, resolution.contributors.len());
        resolution
    }

    /// Verification failed; clear assembly state and re-enter selection
    pub async fn piece_failed(&self, piece: u32) -> Vec<SocketAddr> {
        let mut inner = self.inner.lock().await;

        // Drop any in-flight duplicates before resetting
        let stale: Vec<(SocketAddr, BlockKey)> = inner
            .outstanding
            .keys()
            .filter(|(_, key)| key.piece == piece)
            .copied()
            .collect();
        for entry in stale {
            inner.outstanding.remove(&entry);
        }

        let state = &mut inner.pieces[piece as usize];
        let contributors: Vec<SocketAddr> = state.contributors.iter().copied().collect();
        state.reset();
        warn!("Piece {} failed verification, requeued", piece);
        contributors
    }

    /// Expire requests older than the configured timeout
    pub async fn expire_requests(&self) -> Vec<(SocketAddr, BlockRequest)> {
        let mut inner = self.inner.lock().await;
        let timeout = inner.config.request_timeout;
        let now = Instant::now();

        let expired: Vec<(SocketAddr, BlockKey)> = inner
            .outstanding
            .iter()
            .filter(|(_, &at)| now.duration_since(at) >= timeout)
            .map(|(&k, _)| k)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for (peer, key) in expired {
            inner.outstanding.remove(&(peer, key));
            let block = (key.offset / BLOCK_SIZE) as usize;
            inner.pieces[key.piece as usize].requested[block].remove(&peer);
            let length = inner.block_len(key.piece, block);
            out.push((
                peer,
                BlockRequest {
                    piece: key.piece,
                    offset: key.offset,
                    length,
                },
            ));
        }
        if !out.is_empty() {
            warn!("Expired {} stale requests", out.len());
        }
        out
    }

    /// Whether the peer advertises any piece we still need
    pub async fn is_interesting(&self, peer: SocketAddr) -> bool {
        let inner = self.inner.lock().await;
        inner
            .peers
            .get(&peer)
            .and_then(|slot| slot.bitfield.as_ref())
            .map(|bf| bf.offers_piece_missing_from(&inner.have))
            .unwrap_or(false)
    }

    pub async fn outstanding_count(&self, peer: SocketAddr) -> usize {
        let inner = self.inner.lock().await;
        inner.outstanding.keys().filter(|(p, _)| *p == peer).count()
    }

    pub async fn is_endgame(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.in_endgame()
    }

    /// Pieces still needed
    pub async fn needed_count(&self) -> u32 {
        let inner = self.inner.lock().await;
        inner.pieces.iter().filter(|p| p.needed).count() as u32
    }
}

impl Inner {
    fn block_len(&self, piece: u32, block: usize) -> u32 {
        let piece_len = self.metainfo.piece_len(piece);
        let start = block as u32 * BLOCK_SIZE;
        BLOCK_SIZE.min(piece_len - start)
    }

    fn reclaim_outstanding(&mut self, peer: SocketAddr) -> Vec<BlockRequest> {
        let keys: Vec<BlockKey> = self
            .outstanding
            .keys()
            .filter(|(p, _)| *p == peer)
            .map(|(_, key)| *key)
            .collect();

        let mut reclaimed = Vec::with_capacity(keys.len());
        for key in keys {
            self.outstanding.remove(&(peer, key));
            let block = (key.offset / BLOCK_SIZE) as usize;
            self.pieces[key.piece as usize].requested[block].remove(&peer);
            reclaimed.push(BlockRequest {
                piece: key.piece,
                offset: key.offset,
                length: self.block_len(key.piece, block),
            });
        }
        reclaimed
    }

    fn outstanding_for(&self, peer: SocketAddr) -> usize {
        self.outstanding.keys().filter(|(p, _)| *p == peer).count()
    }

    /// Every missing block already has a request in flight somewhere
    fn in_endgame(&self) -> bool {
        self.pieces.iter().all(|piece| {
            !piece.needed
                || piece
                    .received
                    .iter()
                    .zip(&piece.requested)
                    .all(|(&received, requested)| received || !requested.is_empty())
        })
    }

    fn fill_pipeline(&mut self, peer: SocketAddr) -> Vec<BlockRequest> {
        let Some(slot) = self.peers.get(&peer) else {
            return Vec::new();
        };
        if slot.choked {
            return Vec::new();
        }
        let Some(bitfield) = slot.bitfield.clone() else {
            return Vec::new();
        };

        let mut budget = self
            .config
            .pipeline_depth
            .saturating_sub(self.outstanding_for(peer));
        let mut issued = Vec::new();

        // First pass: fresh blocks, finishing started pieces before opening
        // new ones, new ones in rarest-first order.
        while budget > 0 {
            let Some((piece, block)) = self.pick_fresh_block(peer, &bitfield) else {
                break;
            };
            issued.push(self.issue(peer, piece, block));
            budget -= 1;
        }

        // Endgame pass: duplicate still-missing blocks onto this peer.
        if budget > 0 && self.in_endgame() {
            let dupes = self.pick_endgame_blocks(peer, &bitfield, budget);
            for (piece, block) in dupes {
                issued.push(self.issue(peer, piece, block));
            }
        }

        if !issued.is_empty() {
            trace!("Issued {} requests to {}", issued.len(), peer);
        }
        issued
    }

    fn issue(&mut self, peer: SocketAddr, piece: u32, block: usize) -> BlockRequest {
        let offset = block as u32 * BLOCK_SIZE;
        self.pieces[piece as usize].requested[block].insert(peer);
        self.outstanding.insert(
            (
                peer,
                BlockKey { piece, offset },
            ),
            Instant::now(),
        );
        BlockRequest {
            piece,
            offset,
            length: self.block_len(piece, block),
        }
    }

    /// Next unrequested block this peer can serve
    fn pick_fresh_block(&mut self, peer: SocketAddr, bitfield: &Bitfield) -> Option<(u32, usize)> {
        // Finish partially progressed pieces first
        let mut started: Vec<u32> = (0..self.metainfo.num_pieces())
            .filter(|&i| {
                let state = &self.pieces[i as usize];
                state.needed
                    && bitfield.has(i)
                    && (state.received.iter().any(|&r| r)
                        || state.requested.iter().any(|s| !s.is_empty()))
            })
            .collect();
        started.sort_by_key(|&i| (self.availability[i as usize], i));
        for piece in started {
            if let Some(block) = self.first_fresh_block(piece) {
                return Some((piece, block));
            }
        }

        // Open a new piece, rarest first; uniform among the rarest few
        // until something has verified.
        let mut untouched: Vec<u32> = (0..self.metainfo.num_pieces())
            .filter(|&i| {
                let state = &self.pieces[i as usize];
                state.needed
                    && bitfield.has(i)
                    && !state.received.iter().any(|&r| r)
                    && state.requested.iter().all(HashSet::is_empty)
            })
            .collect();
        if untouched.is_empty() {
            return None;
        }
        untouched.sort_by_key(|&i| (self.availability[i as usize], i));

        let piece = if !self.any_verified && untouched.len() > 1 {
            let window = untouched.len().min(self.config.early_window);
            untouched[rand::thread_rng().gen_range(0..window)]
        } else {
            untouched[0]
        };
        self.first_fresh_block(piece).map(|block| (piece, block))
    }

    fn first_fresh_block(&self, piece: u32) -> Option<usize> {
        let state = &self.pieces[piece as usize];
        state
            .received
            .iter()
            .zip(&state.requested)
            .position(|(&received, requested)| !received && requested.is_empty())
    }

    /// Missing blocks to duplicate onto `peer`, fewest requesters first
    fn pick_endgame_blocks(
        &self,
        peer: SocketAddr,
        bitfield: &Bitfield,
        budget: usize,
    ) -> Vec<(u32, usize)> {
        let mut candidates: Vec<(usize, u32, usize)> = Vec::new();
        for piece in 0..self.metainfo.num_pieces() {
            let state = &self.pieces[piece as usize];
            if !state.needed || !bitfield.has(piece) {
                continue;
            }
            for (block, (&received, requested)) in
                state.received.iter().zip(&state.requested).enumerate()
            {
                if !received && !requested.contains(&peer) {
                    candidates.push((requested.len(), piece, block));
                }
            }
        }
        candidates.sort();
        candidates
            .into_iter()
            .take(budget)
            .map(|(_, piece, block)| (piece, block))
            .collect()
    }
}
