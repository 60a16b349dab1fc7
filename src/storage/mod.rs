//! Piece storage
//!
//! Assembles incoming blocks per piece, verifies complete pieces against
//! their hashes, and stripes verified bytes across the payload files.

pub mod file;
pub mod piece;
pub mod resume;

pub use file::{FileSlice, FileStore};
pub use piece::{FinalizeOutcome, PieceAssembly, BLOCK_SIZE};
pub use resume::ResumeData;
