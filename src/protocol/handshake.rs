//! BitTorrent handshake
//!
//! Fixed 68-byte exchange that opens every session.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use crate::error::TorrentError;

/// Protocol identifier carried in every handshake
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake length on the wire
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /// Random peer id with the conventional `-BD0100-` client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-BD0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated peer id: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize to the 68-byte wire layout
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&[0u8; 8]); // reserved
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Parse the 68-byte wire layout
    ///
    /// The length byte must be 19 and the protocol string must match
    /// exactly; anything else is a protocol violation. Reserved bits are
    /// ignored (we advertise none and use none).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol_violation(format!(
                "handshake length {} (expected {})",
                data.len(),
                HANDSHAKE_LEN
            ))
            .into());
        }

        if data[0] as usize != PROTOCOL_STRING.len() {
            warn!("Bad handshake pstrlen: {}", data[0]);
            return Err(TorrentError::protocol_violation(format!(
                "handshake pstrlen {} (expected 19)",
                data[0]
            ))
            .into());
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::protocol_violation("unknown protocol string").into());
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /// Whether the remote is in the swarm we expect
    pub fn matches(&self, expected_info_hash: &[u8; 20]) -> bool {
        self.info_hash == *expected_info_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.encode();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PROTOCOL_STRING);
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[test]
    fn test_roundtrip() {
        let hs = Handshake::new([7u8; 20], [9u8; 20]);
        let decoded = Handshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn test_decode_rejects_wrong_pstrlen() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).encode();
        bytes[0] = 18;
        assert!(Handshake::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_protocol_string() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).encode();
        bytes[1] = b'b';
        assert!(Handshake::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(Handshake::decode(&[19u8; 20]).is_err());
    }

    #[test]
    fn test_matches() {
        let hs = Handshake::new([5u8; 20], [0u8; 20]);
        assert!(hs.matches(&[5u8; 20]));
        assert!(!hs.matches(&[6u8; 20]));
    }

    #[test]
    fn test_generated_peer_id_prefix() {
        let id = Handshake::generate_peer_id();
        assert_eq!(&id[..8], b"-BD0100-");
    }
}
