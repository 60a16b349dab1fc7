//! Session/engine channel types

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TorrentError;
use crate::scheduler::BlockRequest;

/// What a session reports to the engine
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake completed
    Connected {
        peer: SocketAddr,
        peer_id: [u8; 20],
    },
    /// The remote's interest in us changed
    RemoteInterest {
        peer: SocketAddr,
        interested: bool,
    },
    /// A requested block arrived and was accepted
    BlockReceived {
        peer: SocketAddr,
        bytes: usize,
        elapsed: Duration,
    },
    /// We served a block upload
    Uploaded { peer: SocketAddr, bytes: usize },
    /// A piece verified; broadcast `have` and feed scores
    PieceVerified {
        peer: SocketAddr,
        piece: u32,
        contributors: Vec<SocketAddr>,
        cancels: Vec<(SocketAddr, BlockRequest)>,
    },
    /// A piece failed verification and was requeued
    PieceFailed {
        peer: SocketAddr,
        piece: u32,
        contributors: Vec<SocketAddr>,
    },
    /// Endgame duplicates to cancel on other sessions
    Cancels(Vec<(SocketAddr, BlockRequest)>),
    /// The session ended; `error` is `None` on clean shutdown
    Closed {
        peer: SocketAddr,
        error: Option<TorrentError>,
    },
}

/// What the engine tells a session to do
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Announce a freshly verified piece
    SendHave(u32),
    /// Cancel an outstanding request on this session's wire
    SendCancel(BlockRequest),
    /// We no longer want anything this peer has
    SendNotInterested,
    /// Top the request pipeline back up if allowed
    Refill,
    /// Upload choker decisions
    SendUnchoke,
    SendChoke,
    /// Drain and disconnect
    Shutdown,
}

/// The engine's handle on a running session
#[derive(Debug)]
pub struct SessionHandle {
    pub addr: SocketAddr,
    pub commands: mpsc::Sender<SessionCommand>,
    pub task: JoinHandle<()>,
}

impl SessionHandle {
    /// Best-effort command send; a full or closed channel means the
    /// session is already on its way down.
    pub fn send(&self, command: SessionCommand) {
        let _ = self.commands.try_send(command);
    }
}
