//! Byte-level building blocks shared by every row kind: sentinels, the
//! base64 UUID codec, UUIDv7 timestamp extraction, and LRC parity.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use uuid::Uuid;

use crate::config::{ROW_END, ROW_START};
use crate::error::FrozenError;

pub(crate) const UUID_BASE64_LEN: usize = 24;

/// Encodes a 16-byte UUID as its 24-character, `=`-padded standard base64
/// representation.
pub(crate) fn encode_uuid(uuid: &Uuid) -> [u8; UUID_BASE64_LEN] {
    let mut out = [0u8; UUID_BASE64_LEN];
    let written = STANDARD
        .encode_slice(uuid.as_bytes(), &mut out)
        .expect("24-byte buffer always fits a 16-byte input");
    debug_assert_eq!(written, UUID_BASE64_LEN);
    out
}

/// Decodes a 24-character base64 blob back into a UUID.
pub(crate) fn decode_uuid(bytes: &[u8]) -> Result<Uuid, FrozenError> {
    if bytes.len() != UUID_BASE64_LEN {
        return Err(FrozenError::corrupt("uuid payload has wrong length"));
    }
    let mut raw = [0u8; 16];
    let written = STANDARD
        .decode_slice(bytes, &mut raw)
        .map_err(|e| FrozenError::corrupt(format!("uuid payload is not valid base64: {e}")))?;
    if written != 16 {
        return Err(FrozenError::corrupt("uuid payload decoded to wrong length"));
    }
    Ok(Uuid::from_bytes(raw))
}

/// Extracts the 48-bit millisecond timestamp from a UUIDv7's first six
/// bytes, big-endian.
pub(crate) fn uuidv7_timestamp_ms(uuid: &Uuid) -> i64 {
    let b = uuid.as_bytes();
    let mut ts: u64 = 0;
    for &byte in &b[0..6] {
        ts = (ts << 8) | byte as u64;
    }
    ts as i64
}

/// Rejects the Nil UUID and any UUID that is not RFC 4122 variant, version 7.
pub(crate) fn validate_uuidv7(uuid: &Uuid) -> Result<(), FrozenError> {
    if uuid.is_nil() {
        return Err(FrozenError::invalid_input("key must not be the nil uuid"));
    }
    if uuid.get_version_num() != 7 {
        return Err(FrozenError::invalid_input(format!(
            "key must be uuidv7, got version {}",
            uuid.get_version_num()
        )));
    }
    if uuid.get_variant() != uuid::Variant::RFC4122 {
        return Err(FrozenError::invalid_input(
            "key must carry the RFC 4122 variant bits",
        ));
    }
    Ok(())
}

/// XOR of every byte, rendered as two uppercase hex characters. `bytes` must
/// be the row's content up to (but excluding) the parity slot.
pub(crate) fn parity_hex(bytes: &[u8]) -> [u8; 2] {
    let mut acc: u8 = 0;
    for &b in bytes {
        acc ^= b;
    }
    let hex = format!("{:02X}", acc);
    let hex = hex.as_bytes();
    [hex[0], hex[1]]
}

pub(crate) fn is_row_start(byte: u8) -> bool {
    byte == ROW_START
}

pub(crate) fn is_row_end(byte: u8) -> bool {
    byte == ROW_END
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_roundtrip() {
        let uuid = Uuid::now_v7();
        let encoded = encode_uuid(&uuid);
        let decoded = decode_uuid(&encoded).unwrap();
        assert_eq!(uuid, decoded);
    }

    #[test]
    fn nil_uuid_encodes_to_known_constant() {
        let nil = Uuid::nil();
        let encoded = encode_uuid(&nil);
        assert_eq!(&encoded[..], b"AAAAAAAAAAAAAAAAAAAAAA==");
    }

    #[test]
    fn parity_is_xor_of_bytes() {
        assert_eq!(parity_hex(&[0x00, 0x00]), *b"00");
        assert_eq!(parity_hex(&[0xFF, 0x0F]), *b"F0");
    }

    #[test]
    fn validate_rejects_nil_and_wrong_version() {
        assert!(validate_uuidv7(&Uuid::nil()).is_err());
        let v4 = Uuid::new_v4();
        assert!(validate_uuidv7(&v4).is_err());
        let v7 = Uuid::now_v7();
        assert!(validate_uuidv7(&v7).is_ok());
    }

    #[test]
    fn timestamp_extraction_matches_uuid_crate() {
        let uuid = Uuid::now_v7();
        let (secs, _) = uuid.get_timestamp().unwrap().to_unix();
        let expected_ms_component = secs as i64 * 1000;
        let extracted = uuidv7_timestamp_ms(&uuid);
        // Both derive from the same 48-bit field; they must agree to the
        // nearest second at minimum.
        assert!((extracted - expected_ms_component).abs() < 2000);
    }
}
