//! Resume data
//!
//! One JSON file per infohash carrying the bitmap, transfer counters, and
//! last-known peers. The loaded bitmap is advisory; a rescan re-verifies
//! hashes before any of it is trusted.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::TorrentError;

/// Persisted per-torrent state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Infohash as hex
    pub info_hash: String,
    /// Have bitmap, raw MSB-first bytes
    pub bitfield: Vec<u8>,
    /// Lifetime bytes uploaded
    pub uploaded: u64,
    /// Lifetime bytes downloaded
    pub downloaded: u64,
    /// Last-known peers as `ip:port`
    pub peers: Vec<String>,
}

impl ResumeData {
    pub fn new(info_hash: String, num_pieces: u32) -> Self {
        Self {
            info_hash,
            bitfield: vec![0u8; num_pieces.div_ceil(8) as usize],
            uploaded: 0,
            downloaded: 0,
            peers: Vec::new(),
        }
    }

    /// Resume file path for an infohash under a download root
    pub fn path_for(root: &Path, info_hash_hex: &str) -> PathBuf {
        root.join(format!(".{}.resume.json", info_hash_hex))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self).map_err(TorrentError::from)?;
        fs::write(path, data).await.map_err(|e| {
            TorrentError::storage_io_full(
                "Failed to write resume file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        debug!("Saved resume data to {}", path.display());
        Ok(())
    }

    /// Load resume data if present; `None` when no file exists
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path).await {
            Ok(data) => {
                let resume: ResumeData =
                    serde_json::from_slice(&data).map_err(TorrentError::from)?;
                info!("Loaded resume data from {}", path.display());
                Ok(Some(resume))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TorrentError::storage_io_full(
                "Failed to read resume file",
                path.display().to_string(),
                e.to_string(),
            )
            .into()),
        }
    }

    /// Whether this resume file belongs to the given torrent
    pub fn matches(&self, info_hash_hex: &str) -> bool {
        self.info_hash == info_hash_hex
    }
}
