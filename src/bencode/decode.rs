//! Single-pass bencode decoder
//!
//! Walks the buffer once, recording the byte span of every dictionary value
//! as it goes. No bytes are re-encoded to recover a subtree; callers slice
//! the original buffer with the recorded span.

use anyhow::Result;
use tracing::trace;

use crate::bencode::value::{DictEntry, Span, Value};
use crate::error::TorrentError;

/// Decode a complete bencode document
///
/// The whole buffer must be consumed; trailing bytes after the top-level
/// value are rejected.
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut pos = 0;
    let value = parse_value(data, &mut pos)?;

    if pos != data.len() {
        return Err(TorrentError::malformed_bencode_at(
            "trailing bytes after top-level value",
            pos,
        )
        .into());
    }

    trace!("Decoded bencode document: {} bytes", data.len());
    Ok(value)
}

fn parse_value(data: &[u8], pos: &mut usize) -> Result<Value> {
    let byte = *data
        .get(*pos)
        .ok_or_else(|| TorrentError::malformed_bencode_at("truncated input", *pos))?;

    match byte {
        b'i' => parse_int(data, pos),
        b'l' => parse_list(data, pos),
        b'd' => parse_dict(data, pos),
        b'0'..=b'9' => parse_bytes(data, pos).map(Value::Bytes),
        other => Err(TorrentError::malformed_bencode_at(
            format!("invalid value prefix 0x{:02x}", other),
            *pos,
        )
        .into()),
    }
}

fn parse_int(data: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;
    *pos += 1; // 'i'

    let end = data[*pos..]
        .iter()
        .position(|&b| b == b'e')
        .map(|off| *pos + off)
        .ok_or_else(|| TorrentError::malformed_bencode_at("unterminated integer", start))?;

    let body = &data[*pos..end];
    if body.is_empty() {
        return Err(TorrentError::malformed_bencode_at("empty integer", start).into());
    }

    let digits = if body[0] == b'-' { &body[1..] } else { body };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(TorrentError::malformed_bencode_at("non-digit in integer", start).into());
    }

    // Safe: validated ASCII above
    let text = std::str::from_utf8(body).unwrap();
    let value: i64 = text
        .parse()
        .map_err(|_| TorrentError::malformed_bencode_at("integer overflow", start))?;

    *pos = end + 1;
    Ok(Value::Int(value))
}

fn parse_bytes(data: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let start = *pos;

    let colon = data[*pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|off| *pos + off)
        .ok_or_else(|| TorrentError::malformed_bencode_at("unterminated string length", start))?;

    let len_digits = &data[*pos..colon];
    if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
        return Err(TorrentError::malformed_bencode_at("non-digit in string length", start).into());
    }

    let len: usize = std::str::from_utf8(len_digits)
        .unwrap()
        .parse()
        .map_err(|_| TorrentError::malformed_bencode_at("string length overflow", start))?;

    let body_start = colon + 1;
    let body_end = body_start
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| TorrentError::malformed_bencode_at("truncated string body", start))?;

    *pos = body_end;
    Ok(data[body_start..body_end].to_vec())
}

fn parse_list(data: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;
    *pos += 1; // 'l'

    let mut items = Vec::new();
    loop {
        match data.get(*pos) {
            None => {
                return Err(TorrentError::malformed_bencode_at("unterminated list", start).into())
            }
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::List(items));
            }
            Some(_) => items.push(parse_value(data, pos)?),
        }
    }
}

fn parse_dict(data: &[u8], pos: &mut usize) -> Result<Value> {
    let start = *pos;
    *pos += 1; // 'd'

    let mut entries: Vec<DictEntry> = Vec::new();
    loop {
        match data.get(*pos) {
            None => {
                return Err(
                    TorrentError::malformed_bencode_at("unterminated dictionary", start).into(),
                )
            }
            Some(b'e') => {
                *pos += 1;
                return Ok(Value::Dict(entries));
            }
            Some(b) if b.is_ascii_digit() => {
                let key = parse_bytes(data, pos)?;
                if entries.iter().any(|e| e.key == key) {
                    return Err(TorrentError::malformed_bencode_at(
                        format!("duplicate dictionary key {:?}", String::from_utf8_lossy(&key)),
                        *pos,
                    )
                    .into());
                }

                let value_start = *pos;
                let value = parse_value(data, pos)?;
                entries.push(DictEntry {
                    key,
                    value,
                    span: Span {
                        start: value_start,
                        end: *pos,
                    },
                });
            }
            Some(_) => {
                return Err(TorrentError::malformed_bencode_at(
                    "dictionary key must be a byte string",
                    *pos,
                )
                .into())
            }
        }
    }
}
