//! Peer scoring and selection
//!
//! Keeps rolling quality scores per peer and prefers the best candidates
//! when more peers are known than the session budget allows.

pub mod selector;

pub use selector::{PeerScore, ScoreKey, SwarmSelector};
