//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::error::TorrentError;
use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Tunables for one torrent engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Download root the payload files live under
    pub download_dir: PathBuf,
    /// Port for incoming connections and tracker announces
    pub listen_port: u16,
    /// Concurrent peer session limit
    pub max_sessions: usize,
    /// Outstanding requests per unchoked peer
    pub pipeline_depth: usize,
    /// Interested peers unchoked at a time
    pub unchoke_slots: usize,
    /// Peers requested per announce
    pub numwant: u32,
    /// Cap on a single wire frame payload
    pub max_frame_len: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub announce_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Peer silence tolerated before the session is cut
    pub idle_timeout: Duration,
    /// Pending sends drained for this long at shutdown
    pub drain_deadline: Duration,
    /// Load and save a resume file
    pub resume: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            listen_port: 6881,
            max_sessions: 50,
            pipeline_depth: 5,
            unchoke_slots: 4,
            numwant: 50,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            announce_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            drain_deadline: Duration::from_secs(2),
            resume: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TorrentError::invalid_metainfo_field(
                "listen port cannot be 0",
                "listen_port",
            )
            .into());
        }
        if self.max_sessions == 0 {
            return Err(TorrentError::invalid_metainfo_field(
                "session limit must be at least 1",
                "max_sessions",
            )
            .into());
        }
        if self.pipeline_depth == 0 {
            return Err(TorrentError::invalid_metainfo_field(
                "pipeline depth must be at least 1",
                "pipeline_depth",
            )
            .into());
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(TorrentError::invalid_metainfo_field(
                "download directory cannot be empty",
                "download_dir",
            )
            .into());
        }
        Ok(())
    }
}
