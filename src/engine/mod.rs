//! Torrent engine
//!
//! The per-torrent orchestrator plus its configuration and the stats and
//! event stream types the embedder consumes.

pub mod config;
pub mod engine;
pub mod stats;

pub use config::EngineConfig;
pub use engine::{Engine, EngineHandle};
pub use stats::{EngineEvent, EngineStats, TorrentState};
