//! Peer wire protocol
//!
//! Handshake, message codec, length-prefixed framing, and the piece
//! availability bitmap.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod wire;

pub use bitfield::Bitfield;
pub use handshake::{Handshake, HANDSHAKE_LEN, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{Framing, DEFAULT_MAX_FRAME_LEN};
