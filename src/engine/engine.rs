//! Torrent orchestrator
//!
//! Owns storage, the scheduler, the tracker client, and the session table.
//! Runs as one task selecting over session events, announce outcomes, the
//! accept listener, and the stats/sweep clocks. Sessions are supervised
//! through their command channels; nothing reaches into a session's state.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::seq::SliceRandom;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::config::EngineConfig;
use crate::engine::stats::{estimate_eta, EngineEvent, EngineStats, RateTracker, TorrentState};
use crate::error::TorrentError;
use crate::peer::{PeerSession, SessionCommand, SessionContext, SessionEvent, SessionHandle};
use crate::scheduler::{PieceScheduler, SchedulerConfig};
use crate::storage::{FileStore, ResumeData};
use crate::swarm::{ScoreKey, SwarmSelector};
use crate::torrent::Metainfo;
use crate::tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, AnnounceTransport, Identity, PeerEndpoint,
    TrackerClient,
};

/// Floor applied to tracker intervals so a broken tracker cannot make us
/// hammer it
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);
/// Retry delay after a full tier cycle of failures
const ANNOUNCE_RETRY: Duration = Duration::from_secs(60);

/// Builder for one torrent's engine
pub struct Engine {
    metainfo: Arc<Metainfo>,
    config: Arc<EngineConfig>,
    identity: Identity,
    tracker: Option<Arc<dyn AnnounceTransport>>,
}

/// Explicit requests from the embedder
#[derive(Debug, Clone, Copy)]
enum EngineCommand {
    Pause,
    Resume,
}

/// The embedder's handle on a running engine
pub struct EngineHandle {
    stats: watch::Receiver<EngineStats>,
    events: mpsc::Receiver<EngineEvent>,
    commands: mpsc::Sender<EngineCommand>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Latest 1 Hz snapshot
    pub fn latest_stats(&self) -> EngineStats {
        self.stats.borrow().clone()
    }

    pub fn stats_receiver(&self) -> watch::Receiver<EngineStats> {
        self.stats.clone()
    }

    /// Next discrete event; `None` after engine exit
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(EngineCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(EngineCommand::Resume).await;
    }

    /// Signal shutdown and wait for the engine to drain
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if timeout(Duration::from_secs(30), self.task).await.is_err() {
            warn!("Engine did not drain in time");
        }
    }
}

impl Engine {
    pub fn new(metainfo: Metainfo, config: EngineConfig) -> Self {
        let identity = Identity::generate(config.listen_port);
        Self {
            metainfo: Arc::new(metainfo),
            config: Arc::new(config),
            identity,
            tracker: None,
        }
    }

    /// Replace the generated identity (peer id, port, source IP hook)
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the HTTP tracker client (tests stub announces here)
    pub fn with_tracker(mut self, tracker: Arc<dyn AnnounceTransport>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Allocate storage, rescan existing data, and spawn the engine task
    pub async fn start(self) -> Result<EngineHandle> {
        self.config.validate()?;

        let storage = Arc::new(FileStore::new(
            self.config.download_dir.clone(),
            self.metainfo.clone(),
        ));
        storage.allocate().await?;

        // Resume counters are advisory; the rescan decides what we have
        let mut downloaded = 0u64;
        let mut uploaded = 0u64;
        if self.config.resume {
            let path = ResumeData::path_for(&self.config.download_dir, &self.metainfo.info_hash_hex());
            match ResumeData::load(&path).await {
                Ok(Some(resume)) if resume.matches(&self.metainfo.info_hash_hex()) => {
                    downloaded = resume.downloaded;
                    uploaded = resume.uploaded;
                }
                Ok(Some(_)) => warn!("Resume file belongs to a different torrent, ignoring"),
                Ok(None) => {}
                Err(e) => warn!("Unusable resume file, starting fresh: {}", e),
            }
        }
        storage.rescan().await?;
        let have = storage.have_bitmap().await;
        let verified_bytes: u64 = have.present().map(|i| self.metainfo.piece_len(i) as u64).sum();

        let scheduler = Arc::new(PieceScheduler::new(
            self.metainfo.clone(),
            have.clone(),
            SchedulerConfig {
                pipeline_depth: self.config.pipeline_depth,
                request_timeout: self.config.request_timeout,
                early_window: 4,
            },
        ));

        let tracker = match self.tracker {
            Some(t) => t,
            None => Arc::new(TrackerClient::new(&self.identity, self.config.announce_timeout)?),
        };

        let listener = match TcpListener::bind(("0.0.0.0", self.config.listen_port)).await {
            Ok(l) => {
                info!("Listening on port {}", self.config.listen_port);
                Some(l)
            }
            Err(e) => {
                warn!("Could not bind listen port {}: {}", self.config.listen_port, e);
                None
            }
        };

        // Tier order is priority; order within a tier is shuffled once
        let mut tiers: Vec<Vec<String>> = if self.metainfo.announce_list.is_empty() {
            vec![vec![self.metainfo.announce.clone()]]
        } else {
            self.metainfo.announce_list.clone()
        };
        let mut rng = rand::thread_rng();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }

        let (stats_tx, stats_rx) = watch::channel(EngineStats {
            state: if have.is_full() {
                TorrentState::Seeding
            } else {
                TorrentState::Starting
            },
            left: self.metainfo.total_size - verified_bytes,
            downloaded,
            uploaded,
            ..Default::default()
        });
        let (events_tx, events_rx) = mpsc::channel(256);
        let (session_events_tx, session_events_rx) = mpsc::channel(1024);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (announce_tx, announce_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = if have.is_full() {
            TorrentState::Seeding
        } else {
            TorrentState::Starting
        };

        let runner = Runner {
            metainfo: self.metainfo,
            config: self.config,
            identity: self.identity,
            storage,
            scheduler,
            tracker,
            swarm: SwarmSelector::new(),
            tiers,
            session_events_tx,
            shutdown_rx: shutdown_rx.clone(),
            stats_tx,
            events_tx,
            announce_tx,
            known_peers: HashMap::new(),
            sessions: HashMap::new(),
            connected: HashSet::new(),
            unchoked: HashSet::new(),
            interest_queue: VecDeque::new(),
            state,
            downloaded,
            uploaded,
            verified_bytes,
            down_rate: RateTracker::default(),
            up_rate: RateTracker::default(),
            last_error: None,
            next_announce: Instant::now() + Duration::from_secs(1800),
            announce_in_flight: false,
            completed_sent: false,
            paused: false,
            last_stats_at: std::time::Instant::now(),
        };

        let task = tokio::spawn(runner.run(session_events_rx, commands_rx, announce_rx, listener, shutdown_rx));

        Ok(EngineHandle {
            stats: stats_rx,
            events: events_rx,
            commands: commands_tx,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Result of one full announce cycle over the tiers
struct AnnounceOutcome {
    /// Tier and url index that answered, with the response
    success: Option<(usize, usize, AnnounceResponse)>,
    errors: Vec<String>,
    event: Option<AnnounceEvent>,
}

struct Runner {
    metainfo: Arc<Metainfo>,
    config: Arc<EngineConfig>,
    identity: Identity,
    storage: Arc<FileStore>,
    scheduler: Arc<PieceScheduler>,
    tracker: Arc<dyn AnnounceTransport>,
    swarm: SwarmSelector,
    tiers: Vec<Vec<String>>,
    session_events_tx: mpsc::Sender<SessionEvent>,
    shutdown_rx: watch::Receiver<bool>,
    stats_tx: watch::Sender<EngineStats>,
    events_tx: mpsc::Sender<EngineEvent>,
    announce_tx: mpsc::Sender<AnnounceOutcome>,
    known_peers: HashMap<SocketAddr, PeerEndpoint>,
    sessions: HashMap<SocketAddr, SessionHandle>,
    connected: HashSet<SocketAddr>,
    unchoked: HashSet<SocketAddr>,
    interest_queue: VecDeque<SocketAddr>,
    state: TorrentState,
    downloaded: u64,
    uploaded: u64,
    verified_bytes: u64,
    down_rate: RateTracker,
    up_rate: RateTracker,
    last_error: Option<String>,
    next_announce: Instant,
    announce_in_flight: bool,
    completed_sent: bool,
    paused: bool,
    last_stats_at: std::time::Instant,
}

impl Runner {
    async fn run(
        mut self,
        mut session_events: mpsc::Receiver<SessionEvent>,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut announce_rx: mpsc::Receiver<AnnounceOutcome>,
        mut listener: Option<TcpListener>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            "Engine starting for {} ({})",
            self.metainfo.name,
            self.metainfo.info_hash_hex()
        );
        if self.state == TorrentState::Seeding {
            // Everything rescanned clean; nothing left to download
            self.completed_sent = true;
            self.emit(EngineEvent::Completed);
        }
        self.start_announce(Some(AnnounceEvent::Started));

        let mut stats_clock = interval(Duration::from_secs(1));
        stats_clock.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_clock = interval(Duration::from_secs(5));
        sweep_clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                Some(command) = commands.recv() => self.handle_command(command).await,

                Some(event) = session_events.recv() => self.handle_session_event(event).await,

                Some(outcome) = announce_rx.recv() => self.handle_announce_outcome(outcome),

                accepted = accept_next(&mut listener) => {
                    match accepted {
                        Ok((stream, addr)) => self.handle_incoming(stream, addr),
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }

                _ = stats_clock.tick() => self.publish_stats().await,

                _ = sweep_clock.tick() => self.sweep().await,

                _ = sleep_until(self.next_announce), if !self.announce_in_flight && !self.paused => {
                    self.start_announce(None);
                }
            }

            if self.state == TorrentState::Error {
                error!("Engine entering error state: {:?}", self.last_error);
                break;
            }
        }

        self.shutdown_sequence().await;
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            info_hash: self.metainfo.info_hash,
            our_peer_id: self.identity.peer_id,
            metainfo: self.metainfo.clone(),
            storage: self.storage.clone(),
            scheduler: self.scheduler.clone(),
            config: self.config.clone(),
            events: self.session_events_tx.clone(),
            shutdown: self.shutdown_rx.clone(),
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn set_state(&mut self, state: TorrentState) {
        if self.state != state {
            info!("State: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(EngineEvent::StateChanged(state));
        }
    }

    fn score_key(&self, addr: SocketAddr) -> Option<ScoreKey> {
        if let Some(endpoint) = self.known_peers.get(&addr) {
            return Some(ScoreKey::for_endpoint(endpoint));
        }
        match addr {
            SocketAddr::V4(v4) => Some(ScoreKey::Endpoint(v4)),
            SocketAddr::V6(_) => None,
        }
    }

    fn broadcast(&self, command: SessionCommand) {
        for handle in self.sessions.values() {
            handle.send(command.clone());
        }
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Pause => {
                if !self.paused {
                    info!("Pausing");
                    self.paused = true;
                    self.broadcast(SessionCommand::Shutdown);
                    self.set_state(TorrentState::Paused);
                }
            }
            EngineCommand::Resume => {
                if self.paused {
                    info!("Resuming");
                    self.paused = false;
                    let resumed = if self.storage.is_complete().await {
                        TorrentState::Seeding
                    } else {
                        TorrentState::Downloading
                    };
                    self.set_state(resumed);
                    self.start_announce(None);
                }
            }
        }
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { peer, peer_id } => {
                debug!("Session {} connected", peer);
                self.connected.insert(peer);
                if let Some(endpoint) = self.known_peers.get_mut(&peer) {
                    endpoint.peer_id = Some(peer_id.to_vec());
                }
                if self.state == TorrentState::Starting {
                    self.set_state(TorrentState::Downloading);
                }
                self.emit(EngineEvent::PeerConnected(peer));
            }

            SessionEvent::RemoteInterest { peer, interested } => {
                if interested {
                    self.grant_unchoke(peer);
                } else {
                    self.interest_queue.retain(|&p| p != peer);
                    if self.unchoked.remove(&peer) {
                        if let Some(handle) = self.sessions.get(&peer) {
                            handle.send(SessionCommand::SendChoke);
                        }
                        self.promote_waiting();
                    }
                }
            }

            SessionEvent::BlockReceived { peer, bytes, elapsed } => {
                self.downloaded += bytes as u64;
                if let Some(key) = self.score_key(peer) {
                    let secs = elapsed.as_secs_f64().max(1e-3);
                    self.swarm.record_throughput(&key, bytes as f64 / secs);
                    self.swarm.record_response_time(&key, elapsed.as_secs_f64() * 1000.0);
                }
            }

            SessionEvent::Uploaded { peer: _, bytes } => {
                self.uploaded += bytes as u64;
            }

            SessionEvent::PieceVerified {
                peer: _,
                piece,
                contributors,
                cancels,
            } => {
                self.route_cancels(cancels);

                // Disk write happened before this event; every active peer
                // hears about the piece before anything else is scheduled
                // for it.
                self.broadcast(SessionCommand::SendHave(piece));
                self.verified_bytes += self.metainfo.piece_len(piece) as u64;

                for contributor in contributors {
                    if let Some(key) = self.score_key(contributor) {
                        self.swarm.record_verification(&key, true);
                    }
                }
                self.emit(EngineEvent::PieceVerified(piece));

                self.reevaluate_interest().await;

                if self.verified_bytes >= self.metainfo.total_size && !self.completed_sent {
                    self.completed_sent = true;
                    info!("Download complete");
                    self.set_state(TorrentState::Seeding);
                    self.emit(EngineEvent::Completed);
                    self.start_announce(Some(AnnounceEvent::Completed));
                }
            }

            SessionEvent::PieceFailed {
                peer: _,
                piece,
                contributors,
            } => {
                warn!("Piece {} failed verification", piece);
                let err = TorrentError::PieceVerificationFailed { piece };
                self.last_error = Some(format!("{}: {}", err.kind(), err));
                for contributor in contributors {
                    if let Some(key) = self.score_key(contributor) {
                        self.swarm.record_verification(&key, false);
                    }
                }
                self.emit(EngineEvent::PieceFailed(piece));
                // Its blocks are back in the pool; get them re-requested
                self.broadcast(SessionCommand::Refill);
            }

            SessionEvent::Cancels(cancels) => self.route_cancels(cancels),

            SessionEvent::Closed { peer, error } => {
                debug!("Session {} closed: {:?}", peer, error);
                if let Some(handle) = self.sessions.remove(&peer) {
                    handle.task.abort();
                }
                let was_connected = self.connected.remove(&peer);
                self.known_peers.remove(&peer);
                self.interest_queue.retain(|&p| p != peer);
                if self.unchoked.remove(&peer) {
                    self.promote_waiting();
                }

                // Our own shutdown is not the peer's fault
                if let Some(err) = error.filter(|e| !matches!(*e, TorrentError::Cancelled)) {
                    self.last_error = Some(format!("{}: {}", err.kind(), err));
                    if err.is_fatal() {
                        self.set_state(TorrentState::Error);
                        return;
                    }
                    if let Some(key) = self.score_key(peer) {
                        self.swarm.record_failure(&key);
                    }
                }
                if was_connected {
                    self.emit(EngineEvent::PeerDisconnected(peer));
                    // The closed session's requests went back to the pool
                    self.broadcast(SessionCommand::Refill);
                }
                self.connect_more();
            }
        }
    }

    /// Unchoke up to the configured slot count, queueing the rest
    fn grant_unchoke(&mut self, peer: SocketAddr) {
        if self.unchoked.contains(&peer) || self.interest_queue.contains(&peer) {
            return;
        }
        if self.unchoked.len() < self.config.unchoke_slots {
            if let Some(handle) = self.sessions.get(&peer) {
                self.unchoked.insert(peer);
                handle.send(SessionCommand::SendUnchoke);
            }
        } else {
            self.interest_queue.push_back(peer);
        }
    }

    fn promote_waiting(&mut self) {
        while self.unchoked.len() < self.config.unchoke_slots {
            let Some(next) = self.interest_queue.pop_front() else {
                break;
            };
            if let Some(handle) = self.sessions.get(&next) {
                self.unchoked.insert(next);
                handle.send(SessionCommand::SendUnchoke);
            }
        }
    }

    fn route_cancels(&self, cancels: Vec<(SocketAddr, crate::scheduler::BlockRequest)>) {
        for (peer, request) in cancels {
            if let Some(handle) = self.sessions.get(&peer) {
                handle.send(SessionCommand::SendCancel(request));
            }
        }
    }

    /// Peers offering nothing we still need get a not-interested
    async fn reevaluate_interest(&self) {
        for (&addr, handle) in &self.sessions {
            if self.connected.contains(&addr) && !self.scheduler.is_interesting(addr).await {
                handle.send(SessionCommand::SendNotInterested);
            }
        }
    }

    fn handle_incoming(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.paused || self.sessions.len() >= self.config.max_sessions {
            debug!("Rejecting incoming connection from {}", addr);
            return;
        }
        if self.sessions.contains_key(&addr) {
            return;
        }
        info!("Incoming connection from {}", addr);
        let handle = PeerSession::spawn_inbound(self.session_context(), stream, addr);
        self.sessions.insert(addr, handle);
    }

    /// Open outbound sessions up to the budget, best-scored peers first
    fn connect_more(&mut self) {
        if self.paused || self.state == TorrentState::Seeding || self.state == TorrentState::Error {
            return;
        }
        let budget = self.config.max_sessions.saturating_sub(self.sessions.len());
        if budget == 0 {
            return;
        }

        let candidates: Vec<PeerEndpoint> = self
            .known_peers
            .iter()
            .filter(|(addr, _)| !self.sessions.contains_key(addr))
            .map(|(_, endpoint)| endpoint.clone())
            .collect();
        if candidates.is_empty() {
            return;
        }

        for endpoint in self.swarm.select(&candidates, budget) {
            let addr = SocketAddr::V4(endpoint.addr);
            debug!("Dialing {}", addr);
            let handle = PeerSession::spawn_outbound(self.session_context(), addr);
            self.sessions.insert(addr, handle);
        }
    }

    fn start_announce(&mut self, event: Option<AnnounceEvent>) {
        if self.announce_in_flight {
            return;
        }
        self.announce_in_flight = true;

        let tracker = self.tracker.clone();
        let tiers = self.tiers.clone();
        let request = self.announce_request(event);
        let tx = self.announce_tx.clone();
        tokio::spawn(async move {
            let outcome = announce_cycle(tracker, tiers, request).await;
            let _ = tx.send(outcome).await;
        });
    }

    fn announce_request(&self, event: Option<AnnounceEvent>) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.identity.peer_id,
            port: self.identity.port,
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.metainfo.total_size.saturating_sub(self.verified_bytes),
            event,
            numwant: self.config.numwant,
        }
    }

    fn handle_announce_outcome(&mut self, outcome: AnnounceOutcome) {
        self.announce_in_flight = false;

        match outcome.success {
            Some((tier_idx, url_idx, response)) => {
                // The responsive tracker moves to the front of its tier
                if url_idx > 0 {
                    self.tiers[tier_idx].swap(0, url_idx);
                }

                let mut next = response.interval;
                if let Some(min) = response.min_interval {
                    next = next.max(min);
                }
                next = next.max(MIN_ANNOUNCE_INTERVAL);
                self.next_announce = Instant::now() + next;

                let mut fresh = 0usize;
                for endpoint in response.peers {
                    let addr = SocketAddr::V4(endpoint.addr);
                    if self.known_peers.insert(addr, endpoint).is_none() {
                        fresh += 1;
                    }
                }
                debug!(
                    "Announce ok: {} known peers ({} new), next in {:?}",
                    self.known_peers.len(),
                    fresh,
                    next
                );
                self.connect_more();
            }
            None => {
                let summary = outcome.errors.join("; ");
                warn!("All trackers failed: {}", summary);
                self.last_error = Some(format!("TrackerFailure: {}", summary));
                self.emit(EngineEvent::TrackerError(summary));
                self.next_announce = Instant::now() + ANNOUNCE_RETRY;
            }
        }
    }

    /// Expire stale requests, cancel them on the slow peer, and nudge
    /// everyone to refill
    async fn sweep(&mut self) {
        let expired = self.scheduler.expire_requests().await;
        if let Some((_, request)) = expired.first() {
            let err = TorrentError::RequestTimeout {
                piece: request.piece,
                offset: request.offset,
            };
            self.last_error = Some(format!("{}: {}", err.kind(), err));
        }
        for (peer, request) in expired {
            if let Some(handle) = self.sessions.get(&peer) {
                handle.send(SessionCommand::SendCancel(request));
            }
            if let Some(key) = self.score_key(peer) {
                self.swarm.record_failure(&key);
            }
        }
        // Harmless when pipelines are already full
        self.broadcast(SessionCommand::Refill);
    }

    async fn publish_stats(&mut self) {
        let elapsed = self.last_stats_at.elapsed();
        self.last_stats_at = std::time::Instant::now();

        let download_rate = self.down_rate.sample(self.downloaded, elapsed);
        let upload_rate = self.up_rate.sample(self.uploaded, elapsed);
        let left = self.metainfo.total_size.saturating_sub(self.verified_bytes);
        let progress = if self.metainfo.total_size == 0 {
            0.0
        } else {
            self.verified_bytes as f64 / self.metainfo.total_size as f64
        };

        let _ = self.stats_tx.send(EngineStats {
            state: self.state,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
            left,
            progress,
            connected_peers: self.connected.len(),
            total_peers: self.known_peers.len(),
            download_rate,
            upload_rate,
            eta: estimate_eta(left, download_rate),
            last_error: self.last_error.clone(),
        });
    }

    async fn shutdown_sequence(&mut self) {
        info!("Engine shutting down");
        self.broadcast(SessionCommand::Shutdown);
        tokio::time::sleep(self.config.drain_deadline).await;
        for (_, handle) in self.sessions.drain() {
            handle.task.abort();
        }

        // Best-effort stopped announce, strictly sequential
        let request = self.announce_request(Some(AnnounceEvent::Stopped));
        let url = self.tiers.first().and_then(|tier| tier.first()).cloned();
        if let Some(url) = url {
            let _ = timeout(
                self.config.announce_timeout,
                self.tracker.announce(&url, &request),
            )
            .await;
        }

        if self.config.resume {
            let bitmap = self.storage.have_bitmap().await;
            let resume = ResumeData {
                info_hash: self.metainfo.info_hash_hex(),
                bitfield: bitmap.as_bytes().to_vec(),
                uploaded: self.uploaded,
                downloaded: self.downloaded,
                peers: self.known_peers.keys().map(SocketAddr::to_string).collect(),
            };
            let path = ResumeData::path_for(&self.config.download_dir, &self.metainfo.info_hash_hex());
            if let Err(e) = resume.save(&path).await {
                warn!("Could not save resume data: {}", e);
            }
        }

        if self.state != TorrentState::Error {
            self.set_state(TorrentState::Stopped);
        }
        self.publish_stats().await;
        info!("Engine stopped");
    }
}

async fn accept_next(listener: &mut Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

/// Walk the tiers in priority order until one tracker answers
async fn announce_cycle(
    tracker: Arc<dyn AnnounceTransport>,
    tiers: Vec<Vec<String>>,
    request: AnnounceRequest,
) -> AnnounceOutcome {
    let event = request.event;
    let mut errors = Vec::new();

    for (tier_idx, tier) in tiers.iter().enumerate() {
        for (url_idx, url) in tier.iter().enumerate() {
            match tracker.announce(url, &request).await {
                Ok(response) => {
                    return AnnounceOutcome {
                        success: Some((tier_idx, url_idx, response)),
                        errors,
                        event,
                    }
                }
                Err(e) => {
                    debug!("Tracker {} failed: {}", url, e);
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }
    }

    AnnounceOutcome {
        success: None,
        errors,
        event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::metainfo::FileEntry;
    use async_trait::async_trait;
    use sha1::{Digest, Sha1};
    use std::sync::Mutex;

    /// Records announces and replies from a script
    struct StubTracker {
        log: Mutex<Vec<(String, Option<AnnounceEvent>, u64)>>,
        peers: Mutex<Vec<PeerEndpoint>>,
    }

    impl StubTracker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                peers: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<Option<AnnounceEvent>> {
            self.log.lock().unwrap().iter().map(|(_, e, _)| *e).collect()
        }
    }

    #[async_trait]
    impl AnnounceTransport for StubTracker {
        async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
            self.log
                .lock()
                .unwrap()
                .push((url.to_string(), request.event, request.left));
            Ok(AnnounceResponse {
                interval: Duration::from_secs(1800),
                min_interval: None,
                peers: self.peers.lock().unwrap().clone(),
            })
        }
    }

    fn metainfo_with_payload(dir: &std::path::Path, data: &[u8], write_file: bool) -> Metainfo {
        let piece_length = 16_384u32;
        let pieces: Vec<[u8; 20]> = data
            .chunks(piece_length as usize)
            .map(|c| Sha1::digest(c).into())
            .collect();
        if write_file {
            std::fs::write(dir.join("payload.bin"), data).unwrap();
        }
        Metainfo {
            announce: "http://tracker.example.com/ann".to_string(),
            announce_list: vec![],
            info_hash: [0x42u8; 20],
            name: "payload.bin".to_string(),
            piece_length,
            pieces,
            private: false,
            files: vec![FileEntry {
                path: vec!["payload.bin".to_string()],
                length: data.len() as u64,
                offset: 0,
            }],
            total_size: data.len() as u64,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 173) as u8).collect()
    }

    fn config(dir: &std::path::Path, port: u16) -> EngineConfig {
        EngineConfig {
            download_dir: dir.to_path_buf(),
            listen_port: port,
            resume: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_started_and_stopped_announces() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(16_384);
        let metainfo = metainfo_with_payload(dir.path(), &data, false);
        let tracker = StubTracker::new();

        let handle = Engine::new(metainfo, config(dir.path(), 57_101))
            .with_tracker(tracker.clone())
            .start()
            .await
            .unwrap();

        // Wait for the started announce to land
        timeout(Duration::from_secs(5), async {
            loop {
                if !tracker.events().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no announce happened");

        assert_eq!(tracker.events()[0], Some(AnnounceEvent::Started));

        handle.shutdown().await;
        let events = tracker.events();
        assert_eq!(events.last().unwrap(), &Some(AnnounceEvent::Stopped));
    }

    #[tokio::test]
    async fn test_left_reflects_rescanned_data() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(16_384);
        // Payload already fully on disk: rescan verifies it
        let metainfo = metainfo_with_payload(dir.path(), &data, true);
        let tracker = StubTracker::new();

        let handle = Engine::new(metainfo, config(dir.path(), 57_102))
            .with_tracker(tracker.clone())
            .start()
            .await
            .unwrap();

        let stats = handle.latest_stats();
        assert_eq!(stats.left, 0);
        assert_eq!(stats.state, TorrentState::Seeding);

        timeout(Duration::from_secs(5), async {
            loop {
                if !tracker.events().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no announce happened");
        let left_values: Vec<u64> = tracker.log.lock().unwrap().iter().map(|(_, _, l)| *l).collect();
        assert_eq!(left_values[0], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_file_saved_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(32_768);
        let metainfo = metainfo_with_payload(dir.path(), &data, false);
        let info_hash_hex = metainfo.info_hash_hex();
        let tracker = StubTracker::new();

        let handle = Engine::new(metainfo, config(dir.path(), 57_103))
            .with_tracker(tracker.clone())
            .start()
            .await
            .unwrap();
        handle.shutdown().await;

        let path = ResumeData::path_for(dir.path(), &info_hash_hex);
        let resume = ResumeData::load(&path).await.unwrap().unwrap();
        assert!(resume.matches(&info_hash_hex));
        assert_eq!(resume.bitfield, vec![0u8]);
    }

    #[tokio::test]
    async fn test_stats_clock_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(16_384);
        let metainfo = metainfo_with_payload(dir.path(), &data, false);
        let tracker = StubTracker::new();

        let handle = Engine::new(metainfo, config(dir.path(), 57_104))
            .with_tracker(tracker.clone())
            .start()
            .await
            .unwrap();

        let mut stats_rx = handle.stats_receiver();
        timeout(Duration::from_secs(5), stats_rx.changed())
            .await
            .expect("no stats tick")
            .unwrap();
        let stats = stats_rx.borrow().clone();
        assert_eq!(stats.left, 16_384);
        assert_eq!(stats.connected_peers, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_announce_cycle_rotates_on_failure() {
        struct FailFirst {
            calls: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl AnnounceTransport for FailFirst {
            async fn announce(&self, url: &str, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
                self.calls.lock().unwrap().push(url.to_string());
                if url.contains("primary") {
                    Err(TorrentError::tracker_failure_url("down", url).into())
                } else {
                    Ok(AnnounceResponse {
                        interval: Duration::from_secs(1800),
                        min_interval: None,
                        peers: vec![],
                    })
                }
            }
        }

        let tracker = Arc::new(FailFirst {
            calls: Mutex::new(Vec::new()),
        });
        let tiers = vec![
            vec!["http://primary.example.com/ann".to_string()],
            vec!["http://backup.example.com/ann".to_string()],
        ];
        let request = AnnounceRequest {
            info_hash: [0u8; 20],
            peer_id: [0u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Some(AnnounceEvent::Started),
            numwant: 50,
        };

        let outcome = announce_cycle(tracker.clone(), tiers, request).await;
        let (tier_idx, url_idx, _) = outcome.success.expect("backup should answer");
        assert_eq!(tier_idx, 1);
        assert_eq!(url_idx, 0);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(tracker.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_all_trackers_failing_raises_event_but_keeps_running() {
        struct AlwaysFail;

        #[async_trait]
        impl AnnounceTransport for AlwaysFail {
            async fn announce(&self, url: &str, _request: &AnnounceRequest) -> Result<AnnounceResponse> {
                Err(TorrentError::tracker_failure_url("down", url).into())
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let data = payload(16_384);
        let metainfo = metainfo_with_payload(dir.path(), &data, false);

        let mut handle = Engine::new(metainfo, config(dir.path(), 57_105))
            .with_tracker(Arc::new(AlwaysFail))
            .start()
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(5), async {
            loop {
                match handle.next_event().await {
                    Some(EngineEvent::TrackerError(e)) => break e,
                    Some(_) => continue,
                    None => panic!("engine exited"),
                }
            }
        })
        .await
        .expect("no tracker error event");
        assert!(event.contains("down"));

        // Still alive and publishing stats
        let stats = handle.latest_stats();
        assert_ne!(stats.state, TorrentState::Error);

        handle.shutdown().await;
    }
}
