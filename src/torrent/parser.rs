//! Metainfo parser
//!
//! Interprets a decoded bencode tree into [`Metainfo`]. The infohash is
//! computed over the original bytes of the `info` value using the span the
//! decoder recorded; the subtree is never re-encoded for hashing.

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::bencode::{decode, Value};
use crate::error::TorrentError;
use crate::torrent::metainfo::{FileEntry, Metainfo};

/// Parser for .torrent documents
pub struct MetainfoParser;

impl MetainfoParser {
    /// Parse a metainfo document from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<Metainfo> {
        info!("Loading metainfo from: {}", path.display());
        let data = std::fs::read(path).map_err(|e| {
            TorrentError::storage_io_full(
                "Failed to read metainfo file",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        debug!("Read {} bytes of metainfo", data.len());
        Self::parse_bytes(&data)
    }

    /// Parse a metainfo document from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<Metainfo> {
        let root = decode(data)?;
        if root.as_dict().is_none() {
            return Err(TorrentError::invalid_metainfo("root is not a dictionary").into());
        }

        let announce = root
            .get(b"announce")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                TorrentError::invalid_metainfo_field("missing or non-text announce", "announce")
            })?;
        url::Url::parse(&announce).map_err(|e| {
            TorrentError::invalid_metainfo_field(
                format!("announce is not a valid URL: {}", e),
                "announce",
            )
        })?;

        let announce_list = Self::parse_announce_list(&root);

        let info_entry = root.get_entry(b"info").ok_or_else(|| {
            TorrentError::invalid_metainfo_field("missing info dictionary", "info")
        })?;
        if info_entry.value.as_dict().is_none() {
            return Err(
                TorrentError::invalid_metainfo_field("info is not a dictionary", "info").into(),
            );
        }

        // The swarm identity: SHA-1 over the exact source bytes of the
        // info value, whatever their canonical form.
        let info_span = &data[info_entry.span.start..info_entry.span.end];
        let info_hash: [u8; 20] = Sha1::digest(info_span).into();
        debug!("Computed infohash: {}", hex::encode(info_hash));

        let info = &info_entry.value;

        let name = info
            .get(b"name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                TorrentError::invalid_metainfo_field("missing or non-text name", "name")
            })?;

        let piece_length_raw = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or_else(|| {
                TorrentError::invalid_metainfo_field("missing piece length", "piece length")
            })?;
        if piece_length_raw <= 0 || piece_length_raw > u32::MAX as i64 {
            return Err(TorrentError::invalid_metainfo_field(
                format!("piece length {} out of range", piece_length_raw),
                "piece length",
            )
            .into());
        }
        let piece_length = piece_length_raw as u32;

        let pieces_bytes = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::invalid_metainfo_field("missing pieces", "pieces"))?;
        let pieces = Self::parse_piece_hashes(pieces_bytes)?;

        let private = info
            .get(b"private")
            .and_then(Value::as_int)
            .map(|v| v == 1)
            .unwrap_or(false);

        let files = Self::parse_file_table(info, &name)?;
        let total_size: u64 = files.iter().map(|f| f.length).sum();
        if total_size == 0 {
            return Err(TorrentError::invalid_metainfo("torrent has no payload bytes").into());
        }

        let expected_pieces = total_size.div_ceil(piece_length as u64);
        if pieces.len() as u64 != expected_pieces {
            return Err(TorrentError::invalid_metainfo_field(
                format!(
                    "piece count {} disagrees with total size (expected {})",
                    pieces.len(),
                    expected_pieces
                ),
                "pieces",
            )
            .into());
        }

        info!(
            "Parsed metainfo: {} ({} bytes, {} pieces of {})",
            name,
            total_size,
            pieces.len(),
            piece_length
        );

        Ok(Metainfo {
            announce,
            announce_list,
            info_hash,
            name,
            piece_length,
            pieces,
            private,
            files,
            total_size,
        })
    }

    /// Read announce-list tiers, keeping tier order
    fn parse_announce_list(root: &Value) -> Vec<Vec<String>> {
        let mut tiers = Vec::new();
        if let Some(list) = root.get(b"announce-list").and_then(Value::as_list) {
            for tier in list {
                let Some(urls) = tier.as_list() else {
                    continue;
                };
                let tier_urls: Vec<String> = urls
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|u| url::Url::parse(u).is_ok())
                    .map(str::to_owned)
                    .collect();
                if !tier_urls.is_empty() {
                    tiers.push(tier_urls);
                }
            }
        }
        tiers
    }

    /// Split the concatenated pieces field into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::invalid_metainfo_field(
                format!("pieces length {} is not a multiple of 20", pieces_bytes.len()),
                "pieces",
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Build the flat file table with derived offsets
    fn parse_file_table(info: &Value, name: &str) -> Result<Vec<FileEntry>> {
        if let Some(length) = info.get(b"length").and_then(Value::as_int) {
            if length < 0 {
                return Err(TorrentError::invalid_metainfo_field(
                    "negative file length",
                    "length",
                )
                .into());
            }
            Self::check_path_component(name)?;
            return Ok(vec![FileEntry {
                path: vec![name.to_owned()],
                length: length as u64,
                offset: 0,
            }]);
        }

        let file_list = info.get(b"files").and_then(Value::as_list).ok_or_else(|| {
            TorrentError::invalid_metainfo_field("neither length nor files present", "info")
        })?;

        // Multi-file payloads live under a directory named after the torrent
        Self::check_path_component(name)?;

        let mut files = Vec::with_capacity(file_list.len());
        let mut offset = 0u64;
        for entry in file_list {
            let length = entry.get(b"length").and_then(Value::as_int).ok_or_else(|| {
                TorrentError::invalid_metainfo_field("file entry missing length", "files")
            })?;
            if length < 0 {
                return Err(TorrentError::invalid_metainfo_field(
                    "negative file length",
                    "files",
                )
                .into());
            }

            let path_list = entry.get(b"path").and_then(Value::as_list).ok_or_else(|| {
                TorrentError::invalid_metainfo_field("file entry missing path", "files")
            })?;
            let mut path = Vec::with_capacity(path_list.len() + 1);
            path.push(name.to_owned());
            for component in path_list {
                let component = component.as_str().ok_or_else(|| {
                    TorrentError::invalid_metainfo_field("non-text path component", "files")
                })?;
                Self::check_path_component(component)?;
                path.push(component.to_owned());
            }
            if path.len() == 1 {
                return Err(
                    TorrentError::invalid_metainfo_field("empty file path", "files").into(),
                );
            }

            files.push(FileEntry {
                path,
                length: length as u64,
                offset,
            });
            offset += length as u64;
        }

        if files.is_empty() {
            return Err(TorrentError::invalid_metainfo_field("empty file list", "files").into());
        }
        Ok(files)
    }

    /// Reject components that would escape the download root
    fn check_path_component(component: &str) -> Result<()> {
        if component.is_empty()
            || component == ".."
            || component == "."
            || component.contains('/')
            || component.contains('\\')
            || component.contains('\0')
        {
            warn!("Rejecting unsafe path component: {:?}", component);
            return Err(TorrentError::invalid_metainfo_field(
                format!("unsafe path component {:?}", component),
                "path",
            )
            .into());
        }
        Ok(())
    }
}
