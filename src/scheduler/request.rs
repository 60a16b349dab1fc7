//! Request bookkeeping types

use std::net::SocketAddr;

/// Identifies a block within the torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub piece: u32,
    pub offset: u32,
}

/// A block request as it goes over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn key(&self) -> BlockKey {
        BlockKey {
            piece: self.piece,
            offset: self.offset,
        }
    }
}

/// Outcome of reporting an incoming block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReceipt {
    /// The block matched an outstanding request
    Accepted {
        /// Every block of the piece has now been received
        piece_complete: bool,
        /// Duplicate endgame assignments to cancel on other peers
        cancels: Vec<(SocketAddr, BlockRequest)>,
        /// Time from request issue to delivery
        elapsed: std::time::Duration,
    },
    /// No matching request; the payload is discarded
    Unmatched,
}

/// Outcome of marking a piece verified
#[derive(Debug, Clone, Default)]
pub struct PieceResolution {
    /// Peers whose blocks made up the piece, for score feedback
    pub contributors: Vec<SocketAddr>,
    /// Outstanding duplicate requests to cancel
    pub cancels: Vec<(SocketAddr, BlockRequest)>,
}
