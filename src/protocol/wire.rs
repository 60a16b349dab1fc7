//! Length-prefixed framing over an async stream
//!
//! Generic over the reader/writer so session logic is testable against
//! in-memory duplex pipes. The frame cap bounds how much a peer can make us
//! allocate from a single length prefix.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::error::TorrentError;
use crate::protocol::handshake::{Handshake, HANDSHAKE_LEN};
use crate::protocol::message::Message;

/// Default cap on a single frame payload
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

/// Frame reader/writer with a payload cap
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    max_frame_len: usize,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Framing {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Read one complete message
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Message>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| TorrentError::peer_closed(format!("read length prefix: {}", e)))?;
        let length = u32::from_be_bytes(len_buf) as usize;

        if length == 0 {
            trace!("Read keep-alive frame");
            return Ok(Message::KeepAlive);
        }

        if length > self.max_frame_len {
            return Err(TorrentError::protocol_violation(format!(
                "frame payload {} exceeds cap {}",
                length, self.max_frame_len
            ))
            .into());
        }

        let mut payload = vec![0u8; length];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| TorrentError::peer_closed(format!("read frame payload: {}", e)))?;

        let message = Message::decode(&payload)?;
        trace!("Read {:?} frame ({} bytes)", message.id(), length);
        Ok(message)
    }

    /// Write one complete message and flush
    pub async fn write_message<W>(&self, writer: &mut W, message: &Message) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        let frame = message.encode();
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TorrentError::peer_closed(format!("write frame: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| TorrentError::peer_closed(format!("flush frame: {}", e)))?;
        trace!("Wrote {:?} frame ({} bytes)", message.id(), frame.len());
        Ok(())
    }

    /// Read the fixed-size handshake
    pub async fn read_handshake<R>(&self, reader: &mut R) -> Result<Handshake>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| TorrentError::peer_closed(format!("read handshake: {}", e)))?;
        Handshake::decode(&buf)
    }

    /// Write the fixed-size handshake and flush
    pub async fn write_handshake<W>(&self, writer: &mut W, handshake: &Handshake) -> Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        writer
            .write_all(&handshake.encode())
            .await
            .map_err(|e| TorrentError::peer_closed(format!("write handshake: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| TorrentError::peer_closed(format!("flush handshake: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let framing = Framing::default();

        let msg = Message::Request {
            piece: 2,
            offset: 16_384,
            length: 16_384,
        };
        framing.write_message(&mut a, &msg).await.unwrap();
        let read = framing.read_message(&mut b).await.unwrap();
        assert_eq!(read, msg);
    }

    #[tokio::test]
    async fn test_keepalive_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let framing = Framing::default();

        framing.write_message(&mut a, &Message::KeepAlive).await.unwrap();
        let read = framing.read_message(&mut b).await.unwrap();
        assert_eq!(read, Message::KeepAlive);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_violation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let framing = Framing::new(1024);

        // Hand-write a length prefix past the cap
        a.write_all(&(2048u32).to_be_bytes()).await.unwrap();
        a.flush().await.unwrap();

        let err = framing.read_message(&mut b).await.unwrap_err();
        let err = err.downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::ProtocolViolation { .. }));
    }

    #[tokio::test]
    async fn test_truncated_stream_reports_peer_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let framing = Framing::default();

        a.write_all(&(10u32).to_be_bytes()).await.unwrap();
        a.write_all(&[7u8; 3]).await.unwrap();
        drop(a);

        let err = framing.read_message(&mut b).await.unwrap_err();
        let err = err.downcast::<TorrentError>().unwrap();
        assert!(matches!(err, TorrentError::PeerClosed { .. }));
    }

    #[tokio::test]
    async fn test_handshake_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let framing = Framing::default();

        let hs = Handshake::new([3u8; 20], [4u8; 20]);
        framing.write_handshake(&mut a, &hs).await.unwrap();
        let read = framing.read_handshake(&mut b).await.unwrap();
        assert_eq!(read, hs);
    }
}
