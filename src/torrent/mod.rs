//! Metainfo handling
//!
//! Parsing of .torrent documents into [`Metainfo`] and infohash computation
//! over the preserved `info` byte span.

pub mod metainfo;
pub mod parser;

pub use metainfo::{FileEntry, Metainfo};
pub use parser::MetainfoParser;
