//! File-backed piece store
//!
//! Maps piece-relative byte ranges onto the files laid end to end in
//! metainfo order, verifies assembled pieces, and owns the have bitmap.
//! Verified bytes reach disk before the bitmap flips, so a crash mid-write
//! is caught by the next start's rescan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::protocol::Bitfield;
use crate::storage::piece::{FinalizeOutcome, PieceAssembly};
use crate::torrent::Metainfo;

/// One contiguous region of a payload file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub path: PathBuf,
    pub offset: u64,
    pub len: usize,
}

/// Piece store over the torrent's file table
pub struct FileStore {
    root: PathBuf,
    metainfo: Arc<Metainfo>,
    assemblies: Mutex<HashMap<u32, PieceAssembly>>,
    have: RwLock<Bitfield>,
}

impl FileStore {
    pub fn new(root: PathBuf, metainfo: Arc<Metainfo>) -> Self {
        let num_pieces = metainfo.num_pieces();
        Self {
            root,
            metainfo,
            assemblies: Mutex::new(HashMap::new()),
            have: RwLock::new(Bitfield::new(num_pieces)),
        }
    }

    pub fn num_pieces(&self) -> u32 {
        self.metainfo.num_pieces()
    }

    pub fn piece_len(&self, index: u32) -> u32 {
        self.metainfo.piece_len(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn have_bitmap(&self) -> Bitfield {
        self.have.read().await.clone()
    }

    pub async fn verified_count(&self) -> u32 {
        self.have.read().await.count()
    }

    pub async fn is_complete(&self) -> bool {
        self.have.read().await.is_full()
    }

    /// Create every payload file at its declared length
    ///
    /// Files are extended with `set_len`, so unwritten regions stay sparse
    /// where the filesystem supports it.
    pub async fn allocate(&self) -> Result<()> {
        info!("Allocating {} files under {}", self.metainfo.files.len(), self.root.display());
        for entry in &self.metainfo.files {
            let path = self.resolve(&entry.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to create directory",
                        parent.display().to_string(),
                        e.to_string(),
                    )
                })?;
            }
            let file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .await
                .map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to create file",
                        path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            file.set_len(entry.length).await.map_err(|e| {
                TorrentError::storage_io_full(
                    "Failed to set file length",
                    path.display().to_string(),
                    e.to_string(),
                )
            })?;
            debug!("Allocated {} ({} bytes)", path.display(), entry.length);
        }
        Ok(())
    }

    /// Map a piece-relative range onto file regions
    pub fn slices(&self, piece: u32, offset: u32, len: usize) -> Vec<FileSlice> {
        let mut absolute = self.metainfo.piece_offset(piece) + offset as u64;
        let mut remaining = len;
        let mut out = Vec::new();

        for entry in &self.metainfo.files {
            if remaining == 0 {
                break;
            }
            let file_end = entry.offset + entry.length;
            if file_end <= absolute {
                continue;
            }

            let within = absolute - entry.offset;
            let take = ((entry.length - within) as usize).min(remaining);
            out.push(FileSlice {
                path: self.resolve(&entry.path),
                offset: within,
                len: take,
            });
            absolute += take as u64;
            remaining -= take;
        }

        out
    }

    /// Read a block, possibly spanning file boundaries
    pub async fn read(&self, piece: u32, offset: u32, len: usize) -> Result<Vec<u8>> {
        if piece >= self.num_pieces() || offset as usize + len > self.piece_len(piece) as usize {
            return Err(TorrentError::storage_io(format!(
                "read outside piece {} bounds (offset {}, len {})",
                piece, offset, len
            ))
            .into());
        }

        let mut out = Vec::with_capacity(len);
        for slice in self.slices(piece, offset, len) {
            let mut file = fs::File::open(&slice.path).await.map_err(|e| {
                TorrentError::storage_io_full(
                    "Failed to open file for reading",
                    slice.path.display().to_string(),
                    e.to_string(),
                )
            })?;
            file.seek(std::io::SeekFrom::Start(slice.offset))
                .await
                .map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to seek",
                        slice.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            let mut chunk = vec![0u8; slice.len];
            file.read_exact(&mut chunk).await.map_err(|e| {
                TorrentError::storage_io_full(
                    "Failed to read",
                    slice.path.display().to_string(),
                    e.to_string(),
                )
            })?;
            out.extend_from_slice(&chunk);
        }

        trace!("Read piece {} offset {} ({} bytes)", piece, offset, len);
        Ok(out)
    }

    /// Buffer one incoming block into the piece's assembly slot
    pub async fn write_block(&self, piece: u32, offset: u32, data: Vec<u8>) -> Result<()> {
        if piece >= self.num_pieces() {
            return Err(TorrentError::protocol_violation(format!(
                "block for nonexistent piece {}",
                piece
            ))
            .into());
        }

        let mut assemblies = self.assemblies.lock().await;
        let assembly = assemblies
            .entry(piece)
            .or_insert_with(|| PieceAssembly::new(piece, self.metainfo.piece_len(piece)));
        assembly.write_block(offset, data)?;
        trace!(
            "Piece {} assembly: {}/{} blocks",
            piece,
            assembly.present_blocks(),
            assembly.num_blocks()
        );
        Ok(())
    }

    /// Verify and persist a piece once every block is buffered
    ///
    /// On a hash match the bytes are scatter-written to the covered file
    /// regions and the bitmap bit flips after the writes land. On mismatch
    /// the assembly is dropped so the scheduler can redownload.
    pub async fn try_finalize(&self, piece: u32) -> Result<FinalizeOutcome> {
        let assembly = {
            let mut assemblies = self.assemblies.lock().await;
            match assemblies.get(&piece) {
                None => return Ok(FinalizeOutcome::Incomplete),
                Some(asm) if !asm.is_complete() => return Ok(FinalizeOutcome::Incomplete),
                Some(_) => assemblies.remove(&piece).unwrap(),
            }
        };

        let data = assembly.assemble();
        let expected = self
            .metainfo
            .piece_hash(piece)
            .ok_or_else(|| TorrentError::storage_io(format!("no hash for piece {}", piece)))?;
        let actual: [u8; 20] = Sha1::digest(&data).into();

        if actual != *expected {
            warn!("Piece {} hash mismatch, discarding {} bytes", piece, data.len());
            return Ok(FinalizeOutcome::Mismatch);
        }

        self.write_verified(piece, &data).await?;

        let mut have = self.have.write().await;
        have.set(piece);
        debug!("Piece {} verified and persisted ({}/{})", piece, have.count(), have.num_pieces());
        Ok(FinalizeOutcome::Verified)
    }

    /// Scatter-write verified piece bytes across their file regions
    async fn write_verified(&self, piece: u32, data: &[u8]) -> Result<()> {
        let mut written = 0usize;
        for slice in self.slices(piece, 0, data.len()) {
            if let Some(parent) = slice.path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to create directory",
                        parent.display().to_string(),
                        e.to_string(),
                    )
                })?;
            }
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .open(&slice.path)
                .await
                .map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to open file for writing",
                        slice.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            file.seek(std::io::SeekFrom::Start(slice.offset))
                .await
                .map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to seek",
                        slice.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            file.write_all(&data[written..written + slice.len])
                .await
                .map_err(|e| {
                    TorrentError::storage_io_full(
                        "Failed to write",
                        slice.path.display().to_string(),
                        e.to_string(),
                    )
                })?;
            file.flush().await.map_err(|e| {
                TorrentError::storage_io_full(
                    "Failed to flush",
                    slice.path.display().to_string(),
                    e.to_string(),
                )
            })?;
            written += slice.len;
        }
        Ok(())
    }

    /// Re-verify on-disk pieces and rebuild the bitmap
    ///
    /// Pieces whose files are missing or whose hash does not match simply
    /// stay unset; only genuinely present data counts.
    pub async fn rescan(&self) -> Result<u32> {
        let mut verified = 0u32;
        for piece in 0..self.num_pieces() {
            let len = self.piece_len(piece) as usize;
            match self.read(piece, 0, len).await {
                Ok(data) => {
                    let actual: [u8; 20] = Sha1::digest(&data).into();
                    if Some(&actual) == self.metainfo.piece_hash(piece) {
                        self.have.write().await.set(piece);
                        verified += 1;
                    }
                }
                Err(e) => {
                    trace!("Rescan skipping piece {}: {}", piece, e);
                }
            }
        }
        if verified > 0 {
            info!("Rescan verified {} existing pieces", verified);
        }
        Ok(verified)
    }

    fn resolve(&self, components: &[String]) -> PathBuf {
        let mut path = self.root.clone();
        for component in components {
            path.push(component);
        }
        path
    }
}
