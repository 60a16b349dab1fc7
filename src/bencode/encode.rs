//! Canonical bencode encoder
//!
//! Keys are written in lexicographic byte order regardless of the order the
//! tree holds them, so encoding a decoded canonical document reproduces it
//! byte for byte.

use crate::bencode::value::Value;

/// Encode a value tree canonically
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            let mut sorted: Vec<_> = entries.iter().collect();
            sorted.sort_by(|a, b| a.key.cmp(&b.key));

            out.push(b'd');
            for entry in sorted {
                out.extend_from_slice(entry.key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(&entry.key);
                encode_into(&entry.value, out);
            }
            out.push(b'e');
        }
    }
}
