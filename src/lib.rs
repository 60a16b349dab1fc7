//! btdl
//!
//! A BitTorrent download engine: metainfo parsing, tracker announces, the
//! peer wire protocol, rarest-first block scheduling, and hash-verified
//! file storage, with a CLI front end.

pub mod bencode;
pub mod cli;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod swarm;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use bencode::{decode, encode, Value};
pub use cli::{CliArgs, ProgressLine};
pub use engine::{Engine, EngineConfig, EngineEvent, EngineHandle, EngineStats, TorrentState};
pub use peer::{PeerSession, SessionCommand, SessionEvent};
pub use protocol::{Bitfield, Framing, Handshake, Message};
pub use scheduler::{BlockRequest, PieceScheduler, SchedulerConfig};
pub use storage::{FileStore, FinalizeOutcome, ResumeData, BLOCK_SIZE};
pub use swarm::SwarmSelector;
pub use torrent::{Metainfo, MetainfoParser};
pub use tracker::{AnnounceEvent, AnnounceRequest, AnnounceResponse, Identity, TrackerClient};
