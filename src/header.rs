//! The fixed 64-byte versioned preamble (spec §3, §4.2).
//!
//! ```text
//! {sig:"fDB",ver:1,row_size:R,skew_ms:S}\0\0...\0\n
//! ```

use crate::config::{HEADER_SIZE, MAX_ROW_SIZE, MAX_SKEW_MS, MIN_ROW_SIZE};
use crate::error::FrozenError;

const SIGNATURE: &str = "fDB";
const VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub row_size: u32,
    pub skew_ms: u64,
}

impl Header {
    pub fn new(row_size: u32, skew_ms: u64) -> Result<Self, FrozenError> {
        validate_row_size(row_size)?;
        validate_skew(skew_ms)?;
        Ok(Header { row_size, skew_ms })
    }

    /// Emits the 64-byte on-disk representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let json = format!(
            "{{sig:\"{SIGNATURE}\",ver:{VERSION},row_size:{},skew_ms:{}}}",
            self.row_size, self.skew_ms
        );
        let json = json.as_bytes();
        assert!(
            json.len() < HEADER_SIZE - 1,
            "header body must leave room for null padding and the trailing newline"
        );

        let mut out = [0u8; HEADER_SIZE];
        out[..json.len()].copy_from_slice(json);
        // out[json.len()..HEADER_SIZE - 1] is already zero-initialized.
        out[HEADER_SIZE - 1] = b'\n';
        out
    }

    /// Parses and validates the 64-byte preamble, failing closed on any
    /// deviation per spec §4.2.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrozenError> {
        if bytes.len() != HEADER_SIZE {
            return Err(FrozenError::corrupt(format!(
                "header must be exactly {HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[HEADER_SIZE - 1] != b'\n' {
            return Err(FrozenError::corrupt("header is not newline-terminated"));
        }

        let null_pos = bytes[..HEADER_SIZE - 1]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FrozenError::corrupt("header body is not null-terminated"))?;

        if bytes[null_pos..HEADER_SIZE - 1].iter().any(|&b| b != 0) {
            return Err(FrozenError::corrupt(
                "bytes between the header body and the trailing newline must be null",
            ));
        }

        let body = std::str::from_utf8(&bytes[..null_pos])
            .map_err(|_| FrozenError::corrupt("header body is not valid utf-8"))?;

        let fields = parse_body(body)?;

        if fields.sig != SIGNATURE {
            return Err(FrozenError::corrupt(format!(
                "unexpected signature {:?}",
                fields.sig
            )));
        }
        if fields.ver != VERSION {
            return Err(FrozenError::corrupt(format!(
                "unsupported version {}",
                fields.ver
            )));
        }
        validate_row_size(fields.row_size)?;
        validate_skew(fields.skew_ms)?;

        Ok(Header {
            row_size: fields.row_size,
            skew_ms: fields.skew_ms,
        })
    }
}

fn validate_row_size(row_size: u32) -> Result<(), FrozenError> {
    if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&row_size) {
        return Err(FrozenError::corrupt(format!(
            "row_size {row_size} outside [{MIN_ROW_SIZE}, {MAX_ROW_SIZE}]"
        )));
    }
    Ok(())
}

fn validate_skew(skew_ms: u64) -> Result<(), FrozenError> {
    if skew_ms > MAX_SKEW_MS {
        return Err(FrozenError::corrupt(format!(
            "skew_ms {skew_ms} exceeds {MAX_SKEW_MS}"
        )));
    }
    Ok(())
}

struct Fields {
    sig: String,
    ver: u32,
    row_size: u32,
    skew_ms: u64,
}

/// Parses the recognised-field-set `{sig:"...",ver:N,row_size:N,skew_ms:N}`
/// form. This is intentionally not a general JSON parser: the wire format is
/// a closed, ordered field set and any deviation from it is corruption.
fn parse_body(body: &str) -> Result<Fields, FrozenError> {
    let body = body
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| FrozenError::corrupt("header body is not brace-delimited"))?;

    let mut sig = None;
    let mut ver = None;
    let mut row_size = None;
    let mut skew_ms = None;

    for entry in split_top_level(body) {
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| FrozenError::corrupt("malformed header field"))?;
        match key {
            "sig" => {
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .ok_or_else(|| FrozenError::corrupt("sig must be a quoted string"))?;
                sig = Some(value.to_string());
            }
            "ver" => {
                ver = Some(
                    value
                        .parse()
                        .map_err(|_| FrozenError::corrupt("ver is not a valid integer"))?,
                );
            }
            "row_size" => {
                row_size = Some(
                    value
                        .parse()
                        .map_err(|_| FrozenError::corrupt("row_size is not a valid integer"))?,
                );
            }
            "skew_ms" => {
                skew_ms = Some(
                    value
                        .parse()
                        .map_err(|_| FrozenError::corrupt("skew_ms is not a valid integer"))?,
                );
            }
            other => {
                return Err(FrozenError::corrupt(format!(
                    "unrecognised header field {other:?}"
                )))
            }
        }
    }

    Ok(Fields {
        sig: sig.ok_or_else(|| FrozenError::corrupt("header missing sig field"))?,
        ver: ver.ok_or_else(|| FrozenError::corrupt("header missing ver field"))?,
        row_size: row_size.ok_or_else(|| FrozenError::corrupt("header missing row_size field"))?,
        skew_ms: skew_ms.ok_or_else(|| FrozenError::corrupt("header missing skew_ms field"))?,
    })
}

/// Splits on commas that are not inside a quoted string. The field set never
/// contains nested braces, so this is sufficient.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = Header::new(512, 5000).unwrap();
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(encoded[HEADER_SIZE - 1], b'\n');
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn boundary_row_sizes_roundtrip() {
        for row_size in [MIN_ROW_SIZE, MAX_ROW_SIZE] {
            let header = Header::new(row_size, 0).unwrap();
            let decoded = Header::decode(&header.encode()).unwrap();
            assert_eq!(header, decoded);
        }
    }

    #[test]
    fn rejects_bad_signature() {
        let mut encoded = Header::new(512, 0).unwrap().encode();
        encoded[1] = b'x';
        assert!(Header::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_missing_newline() {
        let mut encoded = Header::new(512, 0).unwrap().encode();
        encoded[HEADER_SIZE - 1] = b'x';
        assert!(Header::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_non_null_padding() {
        let mut encoded = Header::new(512, 0).unwrap().encode();
        encoded[HEADER_SIZE - 2] = b'x';
        assert!(Header::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_out_of_range_row_size() {
        assert!(Header::new(MIN_ROW_SIZE - 1, 0).is_err());
        assert!(Header::new(MAX_ROW_SIZE + 1, 0).is_err());
    }

    #[test]
    fn rejects_out_of_range_skew() {
        assert!(Header::new(512, MAX_SKEW_MS + 1).is_err());
    }

    #[test]
    fn wrong_length_is_corrupt() {
        assert!(Header::decode(&[0u8; 63]).is_err());
    }
}
