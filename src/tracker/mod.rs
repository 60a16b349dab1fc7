//! Tracker announce client
//!
//! HTTP(S) GET announces with raw-byte percent-encoding, compact and
//! dictionary peer list parsing, and the identity hook that lets an embedder
//! rewrite the outgoing request.

pub mod client;
pub mod identity;
pub mod peers;

pub use client::{AnnounceEvent, AnnounceRequest, AnnounceResponse, AnnounceTransport, TrackerClient};
pub use identity::{Identity, RequestTransform};
pub use peers::{encode_compact, parse_compact, PeerEndpoint};
