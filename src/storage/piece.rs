//! In-flight piece assembly
//!
//! Presence is tracked per block, never inferred from byte values; a
//! legitimate block may be all zeros.

use anyhow::Result;

use crate::error::TorrentError;

/// Request and transfer unit within a piece
pub const BLOCK_SIZE: u32 = 16_384;

/// Result of attempting to finalize a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Hash matched; bytes are on disk and the bitmap bit is set
    Verified,
    /// Hash mismatch; the assembly was discarded for redownload
    Mismatch,
    /// Not all blocks are present yet
    Incomplete,
}

/// Block buffer for one downloading piece
#[derive(Debug)]
pub struct PieceAssembly {
    index: u32,
    length: u32,
    blocks: Vec<Option<Vec<u8>>>,
}

impl PieceAssembly {
    pub fn new(index: u32, length: u32) -> Self {
        let num_blocks = length.div_ceil(BLOCK_SIZE) as usize;
        Self {
            index,
            length,
            blocks: vec![None; num_blocks],
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Expected length of block `block_index`; the final block may be short
    pub fn block_len(&self, block_index: usize) -> u32 {
        let start = block_index as u32 * BLOCK_SIZE;
        BLOCK_SIZE.min(self.length - start)
    }

    /// Buffer one block at its piece offset
    ///
    /// Offsets must be block-aligned and the data must be exactly the
    /// expected block length; anything else came from a peer ignoring our
    /// request shape.
    pub fn write_block(&mut self, offset: u32, data: Vec<u8>) -> Result<()> {
        if offset % BLOCK_SIZE != 0 {
            return Err(TorrentError::protocol_violation(format!(
                "block offset {} not aligned",
                offset
            ))
            .into());
        }
        let block_index = (offset / BLOCK_SIZE) as usize;
        if block_index >= self.blocks.len() {
            return Err(TorrentError::protocol_violation(format!(
                "block offset {} outside piece {}",
                offset, self.index
            ))
            .into());
        }
        if data.len() as u32 != self.block_len(block_index) {
            return Err(TorrentError::protocol_violation(format!(
                "block length {} (expected {})",
                data.len(),
                self.block_len(block_index)
            ))
            .into());
        }

        self.blocks[block_index] = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    pub fn present_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    /// Offsets and lengths of blocks still missing
    pub fn missing_blocks(&self) -> Vec<(u32, u32)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_none())
            .map(|(i, _)| (i as u32 * BLOCK_SIZE, self.block_len(i)))
            .collect()
    }

    /// Concatenate all blocks; call only when complete
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        for block in self.blocks.iter().flatten() {
            out.extend_from_slice(block);
        }
        out
    }
}
