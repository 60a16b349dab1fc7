//! Peer endpoint lists
//!
//! Trackers return peers either as a bencoded list of dictionaries or as the
//! compact form: 6-byte records of big-endian IPv4 + big-endian port.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::Result;

use crate::error::TorrentError;

/// One peer as reported by a tracker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerEndpoint {
    pub addr: SocketAddrV4,
    /// Only present in dictionary-form responses
    pub peer_id: Option<Vec<u8>>,
}

impl PeerEndpoint {
    pub fn new(addr: SocketAddrV4) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }
}

/// Parse the compact peers byte string
pub fn parse_compact(data: &[u8]) -> Result<Vec<PeerEndpoint>> {
    if data.len() % 6 != 0 {
        return Err(TorrentError::tracker_failure(format!(
            "compact peers length {} is not a multiple of 6",
            data.len()
        ))
        .into());
    }

    Ok(data
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            PeerEndpoint::new(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Encode endpoints into the compact form
pub fn encode_compact(peers: &[PeerEndpoint]) -> Vec<u8> {
    let mut out = Vec::with_capacity(peers.len() * 6);
    for peer in peers {
        out.extend_from_slice(&peer.addr.ip().octets());
        out.extend_from_slice(&peer.addr.port().to_be_bytes());
    }
    out
}
