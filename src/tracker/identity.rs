//! Announce identity hook
//!
//! The identity layer outside this crate decides who we claim to be: the
//! 20-byte peer id, the advertised listen port, an optional source IP, and
//! an optional transform applied to the outgoing announce request. The
//! transform is opaque here; the response must still parse as a normal
//! announce.

use std::net::Ipv4Addr;

use crate::protocol::Handshake;

/// Wraps the outgoing announce request just before it is sent
pub trait RequestTransform: Send + Sync {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder;
}

/// Who we announce as
#[derive(Debug, Clone)]
pub struct Identity {
    pub peer_id: [u8; 20],
    pub port: u16,
    /// Reported to the tracker as the `ip` parameter when set
    pub source_ip: Option<Ipv4Addr>,
}

impl Identity {
    pub fn new(peer_id: [u8; 20], port: u16) -> Self {
        Self {
            peer_id,
            port,
            source_ip: None,
        }
    }

    /// Fresh random identity on the given port
    pub fn generate(port: u16) -> Self {
        Self::new(Handshake::generate_peer_id(), port)
    }

    pub fn with_source_ip(mut self, ip: Ipv4Addr) -> Self {
        self.source_ip = Some(ip);
        self
    }
}
