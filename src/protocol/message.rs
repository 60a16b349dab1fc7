//! Wire messages
//!
//! Every post-handshake frame is a 4-byte big-endian payload length followed
//! by a one-byte type and the payload. Length-zero frames are keep-alives.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};

use crate::error::TorrentError;

/// Message type bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            other => Err(TorrentError::protocol_violation(format!(
                "unknown message id {}",
                other
            ))
            .into()),
        }
    }
}

/// A decoded protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield { bytes: Vec<u8> },
    Request { piece: u32, offset: u32, length: u32 },
    Piece { piece: u32, offset: u32, data: Vec<u8> },
    Cancel { piece: u32, offset: u32, length: u32 },
}

impl Message {
    /// Message id, or `None` for keep-alives
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(MessageId::Choke),
            Message::Unchoke => Some(MessageId::Unchoke),
            Message::Interested => Some(MessageId::Interested),
            Message::NotInterested => Some(MessageId::NotInterested),
            Message::Have { .. } => Some(MessageId::Have),
            Message::Bitfield { .. } => Some(MessageId::Bitfield),
            Message::Request { .. } => Some(MessageId::Request),
            Message::Piece { .. } => Some(MessageId::Piece),
            Message::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    /// Payload length excluding the 4-byte prefix
    pub fn payload_len(&self) -> u32 {
        match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 1,
            Message::Have { .. } => 5,
            Message::Bitfield { bytes } => 1 + bytes.len() as u32,
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len() as u32,
        }
    }

    /// Serialize the full frame including the length prefix
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(4 + self.payload_len() as usize);
        buf.put_u32(self.payload_len());

        if let Some(id) = self.id() {
            buf.put_u8(id as u8);
        }

        match self {
            Message::Have { piece } => buf.put_u32(*piece),
            Message::Bitfield { bytes } => buf.put_slice(bytes),
            Message::Request { piece, offset, length }
            | Message::Cancel { piece, offset, length } => {
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            Message::Piece { piece, offset, data } => {
                buf.put_u32(*piece);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            _ => {}
        }

        buf.to_vec()
    }

    /// Parse a frame payload (bytes after the length prefix)
    ///
    /// An empty payload is a keep-alive.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let mut buf = payload;
        let id = MessageId::try_from(buf.get_u8())?;

        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if buf.remaining() != 4 {
                    return Err(TorrentError::protocol_violation(format!(
                        "have payload {} bytes",
                        buf.remaining()
                    ))
                    .into());
                }
                Ok(Message::Have { piece: buf.get_u32() })
            }
            MessageId::Bitfield => Ok(Message::Bitfield {
                bytes: buf.to_vec(),
            }),
            MessageId::Request => {
                if buf.remaining() != 12 {
                    return Err(TorrentError::protocol_violation(format!(
                        "request payload {} bytes",
                        buf.remaining()
                    ))
                    .into());
                }
                Ok(Message::Request {
                    piece: buf.get_u32(),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
            MessageId::Piece => {
                if buf.remaining() < 8 {
                    return Err(TorrentError::protocol_violation(format!(
                        "piece payload {} bytes",
                        buf.remaining()
                    ))
                    .into());
                }
                Ok(Message::Piece {
                    piece: buf.get_u32(),
                    offset: buf.get_u32(),
                    data: buf.to_vec(),
                })
            }
            MessageId::Cancel => {
                if buf.remaining() != 12 {
                    return Err(TorrentError::protocol_violation(format!(
                        "cancel payload {} bytes",
                        buf.remaining()
                    ))
                    .into());
                }
                Ok(Message::Cancel {
                    piece: buf.get_u32(),
                    offset: buf.get_u32(),
                    length: buf.get_u32(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let frame = msg.encode();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - 4);
        Message::decode(&frame[4..]).unwrap()
    }

    #[test]
    fn test_keepalive_is_four_zero_bytes() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
        assert_eq!(Message::decode(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_flag_messages_roundtrip() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn test_have_roundtrip() {
        assert_eq!(
            roundtrip(Message::Have { piece: 42 }),
            Message::Have { piece: 42 }
        );
    }

    #[test]
    fn test_request_layout() {
        let frame = Message::Request {
            piece: 1,
            offset: 0x4000,
            length: 0x4000,
        }
        .encode();
        assert_eq!(frame.len(), 17);
        assert_eq!(&frame[..4], &[0, 0, 0, 13]);
        assert_eq!(frame[4], 6);
        assert_eq!(&frame[5..9], &[0, 0, 0, 1]);
        assert_eq!(&frame[9..13], &[0, 0, 0x40, 0]);
        assert_eq!(&frame[13..17], &[0, 0, 0x40, 0]);
    }

    #[test]
    fn test_piece_roundtrip() {
        let msg = Message::Piece {
            piece: 3,
            offset: 16_384,
            data: vec![0xAB; 100],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_cancel_roundtrip() {
        let msg = Message::Cancel {
            piece: 9,
            offset: 0,
            length: 16_384,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let msg = Message::Bitfield {
            bytes: vec![0b1100_0000],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_reject_unknown_id() {
        assert!(Message::decode(&[9]).is_err());
        assert!(Message::decode(&[200]).is_err());
    }

    #[test]
    fn test_reject_short_payloads() {
        assert!(Message::decode(&[4, 0, 0]).is_err()); // have needs 4
        assert!(Message::decode(&[6, 0, 0, 0, 1]).is_err()); // request needs 12
        assert!(Message::decode(&[7, 0, 0, 0, 1]).is_err()); // piece needs >= 8
    }
}
