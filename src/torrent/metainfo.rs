//! Torrent metadata
//!
//! The interpreted form of a metainfo file. The file table is flattened to
//! ordered entries with derived absolute offsets; single-file torrents get a
//! synthetic one-entry table whose path is the torrent name.

/// One payload file with its absolute offset in the piece space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path components relative to the download root
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
    /// Sum of the lengths of all preceding files
    pub offset: u64,
}

/// Interpreted torrent metadata
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// Tracker tiers in priority order (may be empty)
    pub announce_list: Vec<Vec<String>>,
    /// SHA-1 of the exact `info` byte span in the source document
    pub info_hash: [u8; 20],
    /// Suggested root file or directory name
    pub name: String,
    /// Piece size, fixed for all but the last piece
    pub piece_length: u32,
    /// Per-piece SHA-1 hashes in order
    pub pieces: Vec<[u8; 20]>,
    /// Private-tracker flag
    pub private: bool,
    /// Ordered file table with derived offsets
    pub files: Vec<FileEntry>,
    /// Sum of all file lengths
    pub total_size: u64,
}

impl Metainfo {
    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Length of piece `index`; the last piece is usually shorter
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        let end = (start + self.piece_length as u64).min(self.total_size);
        (end - start) as u32
    }

    /// Absolute byte offset of piece `index`
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.pieces.get(index as usize)
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Bytes still missing given a count of verified pieces
    pub fn bytes_left(&self, verified_pieces: u32) -> u64 {
        let have: u64 = (0..self.num_pieces())
            .take(verified_pieces as usize)
            .map(|i| self.piece_len(i) as u64)
            .sum();
        self.total_size.saturating_sub(have)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metainfo {
        Metainfo {
            announce: "http://tracker.example.com/announce".to_string(),
            announce_list: vec![],
            info_hash: [1u8; 20],
            name: "sample".to_string(),
            piece_length: 16_384,
            pieces: vec![[2u8; 20], [3u8; 20]],
            private: false,
            files: vec![FileEntry {
                path: vec!["sample".to_string()],
                length: 20_000,
                offset: 0,
            }],
            total_size: 20_000,
        }
    }

    #[test]
    fn test_piece_len_last_short() {
        let info = sample();
        assert_eq!(info.piece_len(0), 16_384);
        assert_eq!(info.piece_len(1), 3_616);
    }

    #[test]
    fn test_piece_offset() {
        let info = sample();
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(1), 16_384);
    }

    #[test]
    fn test_piece_hash() {
        let info = sample();
        assert_eq!(info.piece_hash(0), Some(&[2u8; 20]));
        assert_eq!(info.piece_hash(2), None);
    }

    #[test]
    fn test_info_hash_hex() {
        let info = sample();
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
    }
}
