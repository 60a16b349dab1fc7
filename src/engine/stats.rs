//! Stats snapshots and engine events
//!
//! "Listeners" are explicit stream outputs: a watch channel carrying the
//! 1 Hz stats snapshot and an mpsc stream of discrete events.

use std::net::SocketAddr;
use std::time::Duration;

/// Torrent lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    #[default]
    Starting,
    Downloading,
    Seeding,
    Paused,
    Stopped,
    Error,
}

/// Snapshot published once per second
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub state: TorrentState,
    /// Payload bytes received from peers
    pub downloaded: u64,
    /// Payload bytes served to peers
    pub uploaded: u64,
    /// Bytes still missing from verified pieces
    pub left: u64,
    /// Verified fraction in [0, 1]
    pub progress: f64,
    pub connected_peers: usize,
    pub total_peers: usize,
    /// Smoothed rates, bytes per second
    pub download_rate: f64,
    pub upload_rate: f64,
    pub eta: Option<Duration>,
    /// Kind and one-line description of the most recent error
    pub last_error: Option<String>,
}

/// Discrete happenings for the embedder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged(TorrentState),
    PieceVerified(u32),
    PieceFailed(u32),
    PeerConnected(SocketAddr),
    PeerDisconnected(SocketAddr),
    TrackerError(String),
    Completed,
}

/// Smoothed byte-rate from totals sampled on the stats clock
#[derive(Debug, Default)]
pub struct RateTracker {
    last_total: u64,
    rate: f64,
}

const RATE_GAIN: f64 = 0.3;

impl RateTracker {
    /// Feed the current lifetime total; returns the smoothed rate
    pub fn sample(&mut self, total: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            let delta = total.saturating_sub(self.last_total) as f64;
            let instant = delta / secs;
            self.rate += RATE_GAIN * (instant - self.rate);
        }
        self.last_total = total;
        self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Remaining time at the current rate
pub fn estimate_eta(left: u64, rate: f64) -> Option<Duration> {
    if left == 0 || rate <= 1.0 {
        return None;
    }
    Some(Duration::from_secs_f64(left as f64 / rate))
}
