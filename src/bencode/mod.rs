//! Bencode codec
//!
//! Decoding preserves the byte span of every dictionary value so that the
//! infohash can be taken over the exact source bytes of the `info` subtree.
//! Strings are raw bytes throughout; `pieces` and peer ids are not text.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::decode;
pub use encode::encode;
pub use value::{DictEntry, Span, Value};
