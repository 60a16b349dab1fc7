//! Error types for the download engine
//!
//! One structured error enum covers every component; the `is_fatal` split
//! encodes which kinds kill the torrent and which are recovered by dropping
//! the offending session and reclaiming its requests.

use std::fmt;
use std::net::SocketAddr;

/// Structured error for all engine operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Bencode syntax errors at decode time
    MalformedBencode {
        message: String,
        offset: Option<usize>,
    },

    /// Metainfo that decoded but fails validation
    InvalidMetainfo {
        message: String,
        field: Option<String>,
    },

    /// File I/O failures underneath the piece store
    StorageIo {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// A fully assembled piece whose hash did not match
    PieceVerificationFailed { piece: u32 },

    /// Tracker-reported failure or unusable announce response
    TrackerFailure {
        message: String,
        url: Option<String>,
    },

    /// Peer sent bytes that violate the wire protocol
    ProtocolViolation {
        message: String,
        peer: Option<SocketAddr>,
    },

    /// Handshake carried a different infohash than expected
    InfoHashMismatch { peer: Option<SocketAddr> },

    /// Outbound connect did not complete in time
    ConnectTimeout { addr: SocketAddr },

    /// An outstanding block request expired
    RequestTimeout { piece: u32, offset: u32 },

    /// The remote closed the connection or the socket failed
    PeerClosed {
        peer: Option<SocketAddr>,
        message: String,
    },

    /// Cooperative shutdown interrupted the operation
    Cancelled,
}

impl TorrentError {
    pub fn malformed_bencode(message: impl Into<String>) -> Self {
        TorrentError::MalformedBencode {
            message: message.into(),
            offset: None,
        }
    }

    pub fn malformed_bencode_at(message: impl Into<String>, offset: usize) -> Self {
        TorrentError::MalformedBencode {
            message: message.into(),
            offset: Some(offset),
        }
    }

    pub fn invalid_metainfo(message: impl Into<String>) -> Self {
        TorrentError::InvalidMetainfo {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_metainfo_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::InvalidMetainfo {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn storage_io(message: impl Into<String>) -> Self {
        TorrentError::StorageIo {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    pub fn storage_io_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageIo {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    pub fn storage_io_full(
        message: impl Into<String>,
        path: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        TorrentError::StorageIo {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    pub fn tracker_failure(message: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            message: message.into(),
            url: None,
        }
    }

    pub fn tracker_failure_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::TrackerFailure {
            message: message.into(),
            url: Some(url.into()),
        }
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: None,
        }
    }

    pub fn protocol_violation_peer(message: impl Into<String>, peer: SocketAddr) -> Self {
        TorrentError::ProtocolViolation {
            message: message.into(),
            peer: Some(peer),
        }
    }

    pub fn peer_closed(message: impl Into<String>) -> Self {
        TorrentError::PeerClosed {
            peer: None,
            message: message.into(),
        }
    }

    pub fn peer_closed_at(message: impl Into<String>, peer: SocketAddr) -> Self {
        TorrentError::PeerClosed {
            peer: Some(peer),
            message: message.into(),
        }
    }

    /// Short kind name surfaced on the stats channel
    pub fn kind(&self) -> &'static str {
        match self {
            TorrentError::MalformedBencode { .. } => "MalformedBencode",
            TorrentError::InvalidMetainfo { .. } => "InvalidMetainfo",
            TorrentError::StorageIo { .. } => "StorageIo",
            TorrentError::PieceVerificationFailed { .. } => "PieceVerificationFailed",
            TorrentError::TrackerFailure { .. } => "TrackerFailure",
            TorrentError::ProtocolViolation { .. } => "ProtocolViolation",
            TorrentError::InfoHashMismatch { .. } => "InfoHashMismatch",
            TorrentError::ConnectTimeout { .. } => "ConnectTimeout",
            TorrentError::RequestTimeout { .. } => "RequestTimeout",
            TorrentError::PeerClosed { .. } => "PeerClosed",
            TorrentError::Cancelled => "Cancelled",
        }
    }

    /// Whether this error ends the torrent rather than just a session
    ///
    /// Load-time kinds (`MalformedBencode`, `InvalidMetainfo`) reject the
    /// torrent before it starts; `StorageIo` means the destination is
    /// unusable. Everything else is recovered by dropping a session or
    /// rotating trackers.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::MalformedBencode { .. }
                | TorrentError::InvalidMetainfo { .. }
                | TorrentError::StorageIo { .. }
        )
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::MalformedBencode { message, offset } => {
                if let Some(off) = offset {
                    write!(f, "Malformed bencode: {} (offset: {})", message, off)
                } else {
                    write!(f, "Malformed bencode: {}", message)
                }
            }
            TorrentError::InvalidMetainfo { message, field } => {
                if let Some(field) = field {
                    write!(f, "Invalid metainfo: {} (field: {})", message, field)
                } else {
                    write!(f, "Invalid metainfo: {}", message)
                }
            }
            TorrentError::StorageIo {
                message,
                path,
                source,
            } => match (path, source) {
                (Some(p), Some(s)) => {
                    write!(f, "Storage error: {} (path: {}, source: {})", message, p, s)
                }
                (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                (None, None) => write!(f, "Storage error: {}", message),
            },
            TorrentError::PieceVerificationFailed { piece } => {
                write!(f, "Piece {} failed hash verification", piece)
            }
            TorrentError::TrackerFailure { message, url } => {
                if let Some(url) = url {
                    write!(f, "Tracker failure: {} (url: {})", message, url)
                } else {
                    write!(f, "Tracker failure: {}", message)
                }
            }
            TorrentError::ProtocolViolation { message, peer } => {
                if let Some(peer) = peer {
                    write!(f, "Protocol violation: {} (peer: {})", message, peer)
                } else {
                    write!(f, "Protocol violation: {}", message)
                }
            }
            TorrentError::InfoHashMismatch { peer } => {
                if let Some(peer) = peer {
                    write!(f, "Info hash mismatch in handshake (peer: {})", peer)
                } else {
                    write!(f, "Info hash mismatch in handshake")
                }
            }
            TorrentError::ConnectTimeout { addr } => {
                write!(f, "Connect timeout (addr: {})", addr)
            }
            TorrentError::RequestTimeout { piece, offset } => {
                write!(f, "Request timed out (piece: {}, offset: {})", piece, offset)
            }
            TorrentError::PeerClosed { peer, message } => {
                if let Some(peer) = peer {
                    write!(f, "Peer closed: {} (peer: {})", message, peer)
                } else {
                    write!(f, "Peer closed: {}", message)
                }
            }
            TorrentError::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::StorageIo {
            message: err.to_string(),
            path: None,
            source: Some(err.kind().to_string()),
        }
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::storage_io_full("Failed to parse resume data", "resume", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_bencode_display() {
        let err = TorrentError::malformed_bencode_at("missing terminator", 42);
        assert_eq!(
            err.to_string(),
            "Malformed bencode: missing terminator (offset: 42)"
        );
    }

    #[test]
    fn test_invalid_metainfo_field() {
        let err = TorrentError::invalid_metainfo_field("must be positive", "piece length");
        assert!(err.to_string().contains("piece length"));
        assert_eq!(err.kind(), "InvalidMetainfo");
    }

    #[test]
    fn test_storage_io_full() {
        let err = TorrentError::storage_io_full("write failed", "/dl/file.bin", "disk full");
        assert!(err.to_string().contains("/dl/file.bin"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_fatal_split() {
        assert!(TorrentError::malformed_bencode("x").is_fatal());
        assert!(TorrentError::invalid_metainfo("x").is_fatal());
        assert!(TorrentError::storage_io("x").is_fatal());
        assert!(!TorrentError::tracker_failure("x").is_fatal());
        assert!(!TorrentError::PieceVerificationFailed { piece: 0 }.is_fatal());
        assert!(!TorrentError::Cancelled.is_fatal());
    }

    #[test]
    fn test_protocol_violation_with_peer() {
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let err = TorrentError::protocol_violation_peer("late bitfield", addr);
        assert!(err.to_string().contains("10.0.0.1:6881"));
        assert!(err.to_string().contains("late bitfield"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::StorageIo { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_kind_names() {
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        assert_eq!(TorrentError::ConnectTimeout { addr }.kind(), "ConnectTimeout");
        assert_eq!(
            TorrentError::RequestTimeout { piece: 1, offset: 0 }.kind(),
            "RequestTimeout"
        );
        assert_eq!(TorrentError::Cancelled.kind(), "Cancelled");
    }
}
