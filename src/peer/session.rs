//! Per-connection protocol state machine
//!
//! Each session is one task owning its socket. A small inner reader task
//! forwards decoded frames so the main loop can select over inbound
//! messages, engine commands, and the keep-alive clock without ever
//! cancelling a partial frame read. Outgoing writes all happen on the main
//! loop, so frames never interleave.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::engine::config::EngineConfig;
use crate::error::TorrentError;
use crate::peer::events::{SessionCommand, SessionEvent, SessionHandle};
use crate::peer::state::{PeerFlags, SessionState};
use crate::protocol::{Bitfield, Framing, Handshake, Message};
use crate::scheduler::{BlockReceipt, BlockRequest, PieceScheduler};
use crate::storage::{FileStore, FinalizeOutcome};
use crate::torrent::Metainfo;

/// Shared dependencies handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub info_hash: [u8; 20],
    pub our_peer_id: [u8; 20],
    pub metainfo: Arc<Metainfo>,
    pub storage: Arc<FileStore>,
    pub scheduler: Arc<PieceScheduler>,
    pub config: Arc<EngineConfig>,
    pub events: mpsc::Sender<SessionEvent>,
    pub shutdown: watch::Receiver<bool>,
}

/// One peer connection's state machine
pub struct PeerSession {
    addr: SocketAddr,
    ctx: SessionContext,
    framing: Framing,
    flags: PeerFlags,
    state: SessionState,
    remote_peer_id: Option<[u8; 20]>,
    saw_first_message: bool,
    /// Incoming requests queued for the upload reply path
    pending_serves: VecDeque<BlockRequest>,
}

impl PeerSession {
    /// Dial out, handshake, and run until the connection ends
    pub fn spawn_outbound(ctx: SessionContext, addr: SocketAddr) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let result = Self::run_outbound(task_ctx.clone(), addr, commands_rx).await;
            Self::finish(task_ctx, addr, result).await;
        });
        SessionHandle {
            addr,
            commands: commands_tx,
            task,
        }
    }

    /// Adopt an accepted socket, handshake, and run
    pub fn spawn_inbound(ctx: SessionContext, stream: TcpStream, addr: SocketAddr) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let (read, write) = stream.into_split();
            let result = Self::run(task_ctx.clone(), addr, read, write, commands_rx, false).await;
            Self::finish(task_ctx, addr, result).await;
        });
        SessionHandle {
            addr,
            commands: commands_tx,
            task,
        }
    }

    async fn run_outbound(
        ctx: SessionContext,
        addr: SocketAddr,
        commands: mpsc::Receiver<SessionCommand>,
    ) -> Result<()> {
        debug!("Connecting to {}", addr);
        let stream = timeout(ctx.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TorrentError::ConnectTimeout { addr })?
            .map_err(|e| TorrentError::peer_closed_at(format!("connect: {}", e), addr))?;
        let (read, write) = stream.into_split();
        Self::run(ctx, addr, read, write, commands, true).await
    }

    /// Reclaim requests and report the session's end
    async fn finish(ctx: SessionContext, addr: SocketAddr, result: Result<()>) {
        let reclaimed = ctx.scheduler.drop_peer(addr).await;
        if !reclaimed.is_empty() {
            debug!("Session {} returned {} requests to the pool", addr, reclaimed.len());
        }
        let error = match result {
            Ok(()) => None,
            Err(e) => Some(flatten_error(e, addr)),
        };
        let _ = ctx.events.send(SessionEvent::Closed { peer: addr, error }).await;
    }

    /// Full session lifecycle over arbitrary streams (testable in-memory)
    pub async fn run<R, W>(
        ctx: SessionContext,
        addr: SocketAddr,
        mut read: R,
        mut write: W,
        commands: mpsc::Receiver<SessionCommand>,
        outbound: bool,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send,
    {
        let framing = Framing::new(ctx.config.max_frame_len);
        let ours = Handshake::new(ctx.info_hash, ctx.our_peer_id);

        let theirs = timeout(ctx.config.handshake_timeout, async {
            if outbound {
                framing.write_handshake(&mut write, &ours).await?;
                framing.read_handshake(&mut read).await
            } else {
                let theirs = framing.read_handshake(&mut read).await?;
                framing.write_handshake(&mut write, &ours).await?;
                Ok(theirs)
            }
        })
        .await
        .map_err(|_| TorrentError::peer_closed_at("handshake timed out", addr))??;

        if !theirs.matches(&ctx.info_hash) {
            warn!("Info hash mismatch from {}", addr);
            return Err(TorrentError::InfoHashMismatch { peer: Some(addr) }.into());
        }
        // A mismatched peer id is recorded, never enforced
        info!("Handshake complete with {} ({})", addr, hex::encode(theirs.peer_id));

        let mut session = PeerSession {
            addr,
            ctx: ctx.clone(),
            framing,
            flags: PeerFlags::default(),
            state: SessionState::Idle,
            remote_peer_id: Some(theirs.peer_id),
            saw_first_message: false,
            pending_serves: VecDeque::new(),
        };

        // Advertise what we already have
        let have = ctx.storage.have_bitmap().await;
        if have.count() > 0 {
            framing
                .write_message(
                    &mut write,
                    &Message::Bitfield {
                        bytes: have.as_bytes().to_vec(),
                    },
                )
                .await?;
        }

        ctx.scheduler.register_peer(addr).await;
        let _ = ctx
            .events
            .send(SessionEvent::Connected {
                peer: addr,
                peer_id: theirs.peer_id,
            })
            .await;

        // Reader task: decode frames, enforce the silence cut
        let (inbound_tx, inbound_rx) = mpsc::channel::<Result<Message, TorrentError>>(64);
        let idle_timeout = ctx.config.idle_timeout;
        let reader = tokio::spawn(async move {
            loop {
                match timeout(idle_timeout, framing.read_message(&mut read)).await {
                    Err(_) => {
                        let _ = inbound_tx
                            .send(Err(TorrentError::peer_closed("peer silent past idle timeout")))
                            .await;
                        break;
                    }
                    Ok(Err(e)) => {
                        let _ = inbound_tx.send(Err(flatten_error(e, addr))).await;
                        break;
                    }
                    Ok(Ok(message)) => {
                        if inbound_tx.send(Ok(message)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let result = session.drive(&mut write, inbound_rx, commands).await;
        reader.abort();
        result
    }

    /// Main select loop: inbound frames, engine commands, keep-alive clock
    async fn drive<W>(
        &mut self,
        write: &mut W,
        mut inbound: mpsc::Receiver<Result<Message, TorrentError>>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut keepalive = tokio::time::interval(self.ctx.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.reset(); // the first tick fires one interval from now
        let mut shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    debug!("Session {} shutting down", self.addr);
                    self.shutdown_drain(write, &mut commands).await;
                    return Err(TorrentError::Cancelled.into());
                }

                Some(command) = commands.recv() => {
                    if self.handle_command(write, command).await? {
                        return Ok(());
                    }
                }

                maybe = inbound.recv() => {
                    match maybe {
                        Some(Ok(message)) => {
                            self.handle_message(write, message).await?;
                            self.serve_pending(write).await?;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(TorrentError::peer_closed_at("reader ended", self.addr).into()),
                    }
                }

                _ = keepalive.tick() => {
                    trace!("Sending keep-alive to {}", self.addr);
                    self.framing.write_message(write, &Message::KeepAlive).await?;
                }
            }
        }
    }

    /// Returns `true` when the session should exit cleanly
    async fn handle_command<W>(&mut self, write: &mut W, command: SessionCommand) -> Result<bool>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match command {
            SessionCommand::SendHave(piece) => {
                self.framing
                    .write_message(write, &Message::Have { piece })
                    .await?;
            }
            SessionCommand::SendCancel(request) => {
                self.framing
                    .write_message(
                        write,
                        &Message::Cancel {
                            piece: request.piece,
                            offset: request.offset,
                            length: request.length,
                        },
                    )
                    .await?;
            }
            SessionCommand::SendNotInterested => {
                if self.flags.am_interested {
                    self.flags.am_interested = false;
                    self.framing
                        .write_message(write, &Message::NotInterested)
                        .await?;
                }
            }
            SessionCommand::Refill => {
                self.fill_pipeline(write).await?;
            }
            SessionCommand::SendUnchoke => {
                if self.flags.am_choking {
                    self.flags.am_choking = false;
                    self.framing.write_message(write, &Message::Unchoke).await?;
                }
            }
            SessionCommand::SendChoke => {
                if !self.flags.am_choking {
                    self.flags.am_choking = true;
                    self.pending_serves.clear();
                    self.framing.write_message(write, &Message::Choke).await?;
                }
            }
            SessionCommand::Shutdown => {
                self.drain(write).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_message<W>(&mut self, write: &mut W, message: Message) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let first = !self.saw_first_message;
        self.saw_first_message = true;

        match message {
            Message::KeepAlive => {}

            Message::Bitfield { bytes } => {
                if !first {
                    return Err(TorrentError::protocol_violation_peer(
                        "bitfield after first message",
                        self.addr,
                    )
                    .into());
                }
                let bitfield = Bitfield::from_bytes(bytes, self.ctx.metainfo.num_pieces())?;
                debug!("{} has {}/{} pieces", self.addr, bitfield.count(), bitfield.num_pieces());
                let interesting = self.ctx.scheduler.peer_bitfield(self.addr, bitfield).await;
                if interesting {
                    self.send_interested(write).await?;
                }
            }

            Message::Have { piece } => {
                let interesting = self.ctx.scheduler.peer_has(self.addr, piece).await;
                if interesting {
                    self.send_interested(write).await?;
                }
                self.fill_pipeline(write).await?;
            }

            Message::Choke => {
                debug!("{} choked us", self.addr);
                self.flags.peer_choking = true;
                self.ctx.scheduler.set_peer_choked(self.addr).await;
                self.state = SessionState::Idle;
            }

            Message::Unchoke => {
                debug!("{} unchoked us", self.addr);
                self.flags.peer_choking = false;
                self.ctx.scheduler.set_peer_unchoked(self.addr).await;
                self.fill_pipeline(write).await?;
            }

            Message::Interested => {
                self.flags.peer_interested = true;
                let _ = self
                    .ctx
                    .events
                    .send(SessionEvent::RemoteInterest {
                        peer: self.addr,
                        interested: true,
                    })
                    .await;
            }

            Message::NotInterested => {
                self.flags.peer_interested = false;
                let _ = self
                    .ctx
                    .events
                    .send(SessionEvent::RemoteInterest {
                        peer: self.addr,
                        interested: false,
                    })
                    .await;
            }

            Message::Request { piece, offset, length } => {
                if self.flags.am_choking {
                    trace!("Ignoring request from choked peer {}", self.addr);
                } else {
                    self.queue_serve(piece, offset, length).await;
                }
            }

            Message::Piece { piece, offset, data } => {
                self.handle_block(write, piece, offset, data).await?;
            }

            Message::Cancel { piece, offset, length } => {
                let before = self.pending_serves.len();
                self.pending_serves.retain(|r| {
                    !(r.piece == piece && r.offset == offset && r.length == length)
                });
                if self.pending_serves.len() < before {
                    trace!("Cancelled queued serve for {} (piece {})", self.addr, piece);
                }
            }
        }
        Ok(())
    }

    async fn handle_block<W>(
        &mut self,
        write: &mut W,
        piece: u32,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let receipt = self
            .ctx
            .scheduler
            .block_received(self.addr, piece, offset, data.len() as u32)
            .await;
        match receipt {
            BlockReceipt::Unmatched => {
                trace!("Discarding unmatched block from {} (piece {})", self.addr, piece);
                return Ok(());
            }
            BlockReceipt::Accepted {
                piece_complete,
                cancels,
                elapsed,
            } => {
                let bytes = data.len();
                self.ctx.storage.write_block(piece, offset, data).await?;

                let _ = self
                    .ctx
                    .events
                    .send(SessionEvent::BlockReceived {
                        peer: self.addr,
                        bytes,
                        elapsed,
                    })
                    .await;
                if !cancels.is_empty() {
                    let _ = self.ctx.events.send(SessionEvent::Cancels(cancels)).await;
                }

                if piece_complete {
                    self.finalize_piece(piece).await?;
                }
            }
        }

        self.fill_pipeline(write).await?;
        Ok(())
    }

    /// Verify a fully buffered piece and report the outcome
    async fn finalize_piece(&mut self, piece: u32) -> Result<()> {
        match self.ctx.storage.try_finalize(piece).await? {
            FinalizeOutcome::Verified => {
                let resolution = self.ctx.scheduler.piece_verified(piece).await;
                let _ = self
                    .ctx
                    .events
                    .send(SessionEvent::PieceVerified {
                        peer: self.addr,
                        piece,
                        contributors: resolution.contributors,
                        cancels: resolution.cancels,
                    })
                    .await;
            }
            FinalizeOutcome::Mismatch => {
                let contributors = self.ctx.scheduler.piece_failed(piece).await;
                let _ = self
                    .ctx
                    .events
                    .send(SessionEvent::PieceFailed {
                        peer: self.addr,
                        piece,
                        contributors,
                    })
                    .await;
            }
            FinalizeOutcome::Incomplete => {
                // Scheduler and storage disagree; should not happen
                warn!("Piece {} complete per scheduler but incomplete in storage", piece);
            }
        }
        Ok(())
    }

    async fn send_interested<W>(&mut self, write: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if !self.flags.am_interested {
            self.flags.am_interested = true;
            debug!("Interested in {}", self.addr);
            self.framing.write_message(write, &Message::Interested).await?;
        }
        Ok(())
    }

    /// Top the pipeline up to the budget when allowed to request
    async fn fill_pipeline<W>(&mut self, write: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        if self.flags.peer_choking || !self.flags.am_interested {
            return Ok(());
        }
        let requests = self.ctx.scheduler.next_requests(self.addr).await;
        for request in &requests {
            self.framing
                .write_message(
                    write,
                    &Message::Request {
                        piece: request.piece,
                        offset: request.offset,
                        length: request.length,
                    },
                )
                .await?;
        }
        if !requests.is_empty() {
            self.state = SessionState::Active;
            trace!("Pipelined {} requests to {}", requests.len(), self.addr);
        }
        Ok(())
    }

    /// Queue an upload if the request is one we can actually serve
    async fn queue_serve(&mut self, piece: u32, offset: u32, length: u32) {
        let num_pieces = self.ctx.metainfo.num_pieces();
        if piece >= num_pieces
            || length == 0
            || offset as u64 + length as u64 > self.ctx.metainfo.piece_len(piece) as u64
        {
            warn!(
                "Ignoring out-of-bounds request from {} (piece {}, offset {}, length {})",
                self.addr, piece, offset, length
            );
            return;
        }
        if !self.ctx.storage.have_bitmap().await.has(piece) {
            trace!("Ignoring request for piece {} we do not have", piece);
            return;
        }
        self.pending_serves.push_back(BlockRequest {
            piece,
            offset,
            length,
        });
    }

    /// Upload reply path: read and send every queued block
    async fn serve_pending<W>(&mut self, write: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        while let Some(request) = self.pending_serves.pop_front() {
            if self.flags.am_choking {
                self.pending_serves.clear();
                break;
            }
            let data = self
                .ctx
                .storage
                .read(request.piece, request.offset, request.length as usize)
                .await?;
            let bytes = data.len();
            self.framing
                .write_message(
                    write,
                    &Message::Piece {
                        piece: request.piece,
                        offset: request.offset,
                        data,
                    },
                )
                .await?;
            let _ = self
                .ctx
                .events
                .send(SessionEvent::Uploaded {
                    peer: self.addr,
                    bytes,
                })
                .await;
        }
        Ok(())
    }

    /// Flush queued serves within the drain deadline, then stop
    async fn drain<W>(&mut self, write: &mut W)
    where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = self.ctx.config.drain_deadline;
        if timeout(deadline, self.serve_pending(write)).await.is_err() {
            debug!("Drain deadline hit for {}", self.addr);
        }
    }

    /// Drain on the abort signal: queued commands still get their frames
    /// (haves, cancels) before the socket drops
    async fn shutdown_drain<W>(
        &mut self,
        write: &mut W,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        let deadline = self.ctx.config.drain_deadline;
        let drained = timeout(deadline, async {
            while let Ok(command) = commands.try_recv() {
                if matches!(command, SessionCommand::Shutdown) {
                    break;
                }
                if self.handle_command(write, command).await.is_err() {
                    return;
                }
            }
            let _ = self.serve_pending(write).await;
        })
        .await;
        if drained.is_err() {
            debug!("Drain deadline hit for {}", self.addr);
        }
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> PeerFlags {
        self.flags
    }
}

/// Collapse an anyhow chain into the structured kind for reporting
fn flatten_error(error: anyhow::Error, addr: SocketAddr) -> TorrentError {
    match error.downcast::<TorrentError>() {
        Ok(e) => e,
        Err(other) => TorrentError::peer_closed_at(other.to_string(), addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerConfig;
    use crate::torrent::metainfo::FileEntry;
    use sha1::{Digest, Sha1};
    use tokio::io::DuplexStream;

    struct Fixture {
        ctx: SessionContext,
        events: mpsc::Receiver<SessionEvent>,
        _shutdown_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn fixture(piece_length: u32, data: &[u8]) -> Fixture {
        let pieces: Vec<[u8; 20]> = data
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let metainfo = Arc::new(Metainfo {
            announce: "http://tracker.example.com/ann".to_string(),
            announce_list: vec![],
            info_hash: [0x11u8; 20],
            name: "t.bin".to_string(),
            piece_length,
            pieces,
            private: false,
            files: vec![FileEntry {
                path: vec!["t.bin".to_string()],
                length: data.len() as u64,
                offset: 0,
            }],
            total_size: data.len() as u64,
        });

        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FileStore::new(dir.path().to_path_buf(), metainfo.clone()));
        let config = Arc::new(EngineConfig::default());
        let scheduler = Arc::new(PieceScheduler::new(
            metainfo.clone(),
            Bitfield::new(metainfo.num_pieces()),
            SchedulerConfig {
                pipeline_depth: config.pipeline_depth,
                request_timeout: config.request_timeout,
                early_window: 4,
            },
        ));
        let (events_tx, events_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Fixture {
            ctx: SessionContext {
                info_hash: [0x11u8; 20],
                our_peer_id: [0x22u8; 20],
                metainfo,
                storage,
                scheduler,
                config,
                events: events_tx,
                shutdown: shutdown_rx,
            },
            events: events_rx,
            _shutdown_tx: shutdown_tx,
            _dir: dir,
        }
    }

    /// Remote side of the wire for scripting a fake peer
    struct FakePeer {
        stream: DuplexStream,
        framing: Framing,
    }

    impl FakePeer {
        async fn handshake(&mut self, info_hash: [u8; 20]) -> Handshake {
            let theirs = self.framing.read_handshake(&mut self.stream).await.unwrap();
            let ours = Handshake::new(info_hash, [0x33u8; 20]);
            self.framing.write_handshake(&mut self.stream, &ours).await.unwrap();
            theirs
        }

        async fn send(&mut self, message: &Message) {
            self.framing.write_message(&mut self.stream, message).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            self.framing.read_message(&mut self.stream).await.unwrap()
        }

        /// Read until a non-keep-alive frame arrives
        async fn recv_frame(&mut self) -> Message {
            loop {
                match self.recv().await {
                    Message::KeepAlive => continue,
                    other => return other,
                }
            }
        }
    }

    fn start_session(
        fx: &Fixture,
        addr: SocketAddr,
    ) -> (FakePeer, mpsc::Sender<SessionCommand>, tokio::task::JoinHandle<Result<()>>) {
        let (ours, theirs) = tokio::io::duplex(1 << 16);
        let (read, write) = tokio::io::split(ours);
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let ctx = fx.ctx.clone();
        let task = tokio::spawn(async move {
            PeerSession::run(ctx, addr, read, write, commands_rx, true).await
        });
        (
            FakePeer {
                stream: theirs,
                framing: Framing::default(),
            },
            commands_tx,
            task,
        )
    }

    fn addr(n: u8) -> SocketAddr {
        format!("10.1.1.{}:6881", n).parse().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_then_unchoke_fills_pipeline() {
        // Five single-block pieces; the pipeline budget is five
        let data = payload(5 * 16_384);
        let mut fx = fixture(16_384, &data);
        let (mut peer, _commands, _task) = start_session(&fx, addr(1));

        let theirs = peer.handshake([0x11u8; 20]).await;
        assert_eq!(theirs.peer_id, [0x22u8; 20]);

        // Full bitfield makes the session interested
        let mut bf = Bitfield::new(5);
        for i in 0..5 {
            bf.set(i);
        }
        peer.send(&Message::Bitfield { bytes: bf.as_bytes().to_vec() }).await;
        assert_eq!(peer.recv_frame().await, Message::Interested);

        // Unchoke: the whole pipeline arrives in one scheduling step
        peer.send(&Message::Unchoke).await;
        let mut pieces_requested = Vec::new();
        for _ in 0..5 {
            match peer.recv_frame().await {
                Message::Request { piece, offset, length } => {
                    assert_eq!(offset, 0);
                    assert_eq!(length, 16_384);
                    pieces_requested.push(piece);
                }
                other => panic!("expected request, got {:?}", other),
            }
        }
        pieces_requested.sort();
        pieces_requested.dedup();
        assert_eq!(pieces_requested.len(), 5);

        // Connected event was emitted
        match fx.events.recv().await.unwrap() {
            SessionEvent::Connected { peer: p, peer_id } => {
                assert_eq!(p, addr(1));
                assert_eq!(peer_id, [0x33u8; 20]);
            }
            other => panic!("expected Connected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_block_delivery_verifies_piece() {
        let data = payload(2 * 16_384);
        let mut fx = fixture(16_384, &data);
        let (mut peer, _commands, _task) = start_session(&fx, addr(1));

        peer.handshake([0x11u8; 20]).await;
        let mut bf = Bitfield::new(2);
        bf.set(0);
        bf.set(1);
        peer.send(&Message::Bitfield { bytes: bf.as_bytes().to_vec() }).await;
        assert_eq!(peer.recv_frame().await, Message::Interested);
        peer.send(&Message::Unchoke).await;

        // Both single-block pieces fit in one pipeline fill
        let mut requests = Vec::new();
        for _ in 0..2 {
            match peer.recv_frame().await {
                Message::Request { piece, offset, length } => {
                    requests.push((piece, offset, length))
                }
                other => panic!("expected request, got {:?}", other),
            }
        }
        for (piece, offset, length) in requests {
            let start = piece as usize * 16_384 + offset as usize;
            peer.send(&Message::Piece {
                piece,
                offset,
                data: data[start..start + length as usize].to_vec(),
            })
            .await;
        }

        let mut verified = 0u32;
        while verified < 2 {
            if let SessionEvent::PieceVerified { .. } = fx.events.recv().await.unwrap() {
                verified += 1;
            }
        }

        assert!(fx.ctx.storage.is_complete().await);
    }

    #[tokio::test]
    async fn test_late_bitfield_is_violation() {
        let data = payload(16_384);
        let fx = fixture(16_384, &data);
        let (mut peer, _commands, task) = start_session(&fx, addr(1));

        peer.handshake([0x11u8; 20]).await;
        peer.send(&Message::Have { piece: 0 }).await;
        peer.send(&Message::Bitfield { bytes: vec![0x80] }).await;

        let result = task.await.unwrap();
        let err = result.unwrap_err().downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_bitfield_bad_padding_is_violation() {
        // 1 piece: 7 padding bits must be zero
        let data = payload(16_384);
        let fx = fixture(16_384, &data);
        let (mut peer, _commands, task) = start_session(&fx, addr(1));

        peer.handshake([0x11u8; 20]).await;
        peer.send(&Message::Bitfield { bytes: vec![0xC0] }).await;

        let result = task.await.unwrap();
        let err = result.unwrap_err().downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_drops_connection() {
        let data = payload(16_384);
        let fx = fixture(16_384, &data);
        let (mut peer, _commands, task) = start_session(&fx, addr(1));

        peer.handshake([0x99u8; 20]).await;

        let result = task.await.unwrap();
        let err = result.unwrap_err().downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::InfoHashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_choke_clears_outstanding() {
        let data = payload(4 * 16_384);
        let fx = fixture(16_384, &data);
        let (mut peer, _commands, _task) = start_session(&fx, addr(1));

        peer.handshake([0x11u8; 20]).await;
        let mut bf = Bitfield::new(4);
        for i in 0..4 {
            bf.set(i);
        }
        peer.send(&Message::Bitfield { bytes: bf.as_bytes().to_vec() }).await;
        assert_eq!(peer.recv_frame().await, Message::Interested);
        peer.send(&Message::Unchoke).await;

        // Four requests land
        for _ in 0..4 {
            assert!(matches!(peer.recv_frame().await, Message::Request { .. }));
        }
        assert_eq!(fx.ctx.scheduler.outstanding_count(addr(1)).await, 4);

        peer.send(&Message::Choke).await;
        // Wait for the session to process the choke
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if fx.ctx.scheduler.outstanding_count(addr(1)).await == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("outstanding requests were not reclaimed");
    }

    #[tokio::test]
    async fn test_upload_reply_path() {
        // We hold the only piece; the remote requests a block
        let data = payload(16_384);
        let mut fx = fixture(16_384, &data);
        fx.ctx.storage.write_block(0, 0, data.clone()).await.unwrap();
        fx.ctx.storage.try_finalize(0).await.unwrap();

        let (mut peer, commands, _task) = start_session(&fx, addr(1));
        peer.handshake([0x11u8; 20]).await;

        // Our side advertises its bitmap first
        match peer.recv_frame().await {
            Message::Bitfield { bytes } => assert_eq!(bytes, vec![0x80]),
            other => panic!("expected bitfield, got {:?}", other),
        }

        peer.send(&Message::Interested).await;
        commands.send(SessionCommand::SendUnchoke).await.unwrap();
        assert_eq!(peer.recv_frame().await, Message::Unchoke);

        peer.send(&Message::Request {
            piece: 0,
            offset: 0,
            length: 4_096,
        })
        .await;
        match peer.recv_frame().await {
            Message::Piece { piece, offset, data: served } => {
                assert_eq!(piece, 0);
                assert_eq!(offset, 0);
                assert_eq!(served, data[..4_096]);
            }
            other => panic!("expected piece, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_while_choking_ignored() {
        let data = payload(16_384);
        let mut fx = fixture(16_384, &data);
        fx.ctx.storage.write_block(0, 0, data.clone()).await.unwrap();
        fx.ctx.storage.try_finalize(0).await.unwrap();

        let (mut peer, commands, _task) = start_session(&fx, addr(1));
        peer.handshake([0x11u8; 20]).await;
        peer.recv_frame().await; // our bitfield

        // Never unchoked: the request must go unanswered
        peer.send(&Message::Request {
            piece: 0,
            offset: 0,
            length: 4_096,
        })
        .await;

        // A have command proves the wire is still alive and nothing else
        // was sent in between
        commands.send(SessionCommand::SendHave(0)).await.unwrap();
        assert_eq!(peer.recv_frame().await, Message::Have { piece: 0 });
    }

    #[tokio::test]
    async fn test_unmatched_piece_discarded_nonfatally() {
        let data = payload(16_384);
        let mut fx = fixture(16_384, &data);
        let (mut peer, commands, _task) = start_session(&fx, addr(1));

        peer.handshake([0x11u8; 20]).await;
        peer.send(&Message::Piece {
            piece: 0,
            offset: 0,
            data: vec![0u8; 16_384],
        })
        .await;

        // Session is still up and responsive
        commands.send(SessionCommand::SendHave(0)).await.unwrap();
        assert_eq!(peer.recv_frame().await, Message::Have { piece: 0 });

        // Nothing landed in storage
        assert_eq!(fx.ctx.storage.verified_count().await, 0);
        // Drain events: no BlockReceived
        while let Ok(event) = fx.events.try_recv() {
            assert!(!matches!(event, SessionEvent::BlockReceived { .. }));
        }
    }
}
