//! Row codec (spec §3, §4.3): `DataRow`, `NullRow`, `ChecksumRow`, and the
//! incrementally-emitted `PartialDataRow`.

use uuid::Uuid;

use crate::config::{NULL_PAD, ROW_END, ROW_START};
use crate::error::FrozenError;
use crate::primitives::{
    decode_uuid, encode_uuid, is_row_end, is_row_start, parity_hex, uuidv7_timestamp_ms,
    validate_uuidv7, UUID_BASE64_LEN,
};

pub(crate) const START_TRANSACTION: u8 = b'T';
pub(crate) const START_CONTINUE: u8 = b'R';
pub(crate) const START_CHECKSUM: u8 = b'C';

/// The two-byte code in `pos R-5..R-3` identifying a row's role in the
/// transactional protocol (spec §4, §6 control-code table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndControl {
    /// `TC` — data row, commits the transaction.
    Commit,
    /// `RE` — data row, continues the transaction.
    Continue,
    /// `SC` — savepoint row, commits the transaction.
    SavepointCommit,
    /// `SE` — savepoint row, continues the transaction.
    SavepointContinue,
    /// `NR` — null-row terminator.
    Null,
    /// `CS` — checksum-row terminator.
    Checksum,
    /// `Rn` — rollback to savepoint `n`, no savepoint on this row.
    Rollback(u8),
    /// `Sn` — rollback to savepoint `n`, this row is itself a savepoint.
    SavepointRollback(u8),
}

impl EndControl {
    pub(crate) fn encode(self) -> [u8; 2] {
        match self {
            EndControl::Commit => *b"TC",
            EndControl::Continue => *b"RE",
            EndControl::SavepointCommit => *b"SC",
            EndControl::SavepointContinue => *b"SE",
            EndControl::Null => *b"NR",
            EndControl::Checksum => *b"CS",
            EndControl::Rollback(n) => [b'R', digit(n)],
            EndControl::SavepointRollback(n) => [b'S', digit(n)],
        }
    }

    pub(crate) fn decode(bytes: [u8; 2]) -> Result<Self, FrozenError> {
        Ok(match bytes {
            [b'T', b'C'] => EndControl::Commit,
            [b'R', b'E'] => EndControl::Continue,
            [b'S', b'C'] => EndControl::SavepointCommit,
            [b'S', b'E'] => EndControl::SavepointContinue,
            [b'N', b'R'] => EndControl::Null,
            [b'C', b'S'] => EndControl::Checksum,
            [b'R', d] if d.is_ascii_digit() => EndControl::Rollback(d - b'0'),
            [b'S', d] if d.is_ascii_digit() => EndControl::SavepointRollback(d - b'0'),
            other => {
                return Err(FrozenError::corrupt(format!(
                    "unrecognised end_control {:?}",
                    String::from_utf8_lossy(&other)
                )))
            }
        })
    }

    /// Whether this end_control terminates its transaction.
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, EndControl::Continue | EndControl::SavepointContinue)
    }

    fn is_valid_for_data_row(self) -> bool {
        !matches!(self, EndControl::Null | EndControl::Checksum)
    }
}

fn digit(n: u8) -> u8 {
    debug_assert!(n <= 9);
    b'0' + n
}

fn validate_frame(row_size: usize, bytes: &[u8]) -> Result<(), FrozenError> {
    if bytes.len() != row_size {
        return Err(FrozenError::corrupt(format!(
            "row must be exactly {row_size} bytes, got {}",
            bytes.len()
        )));
    }
    if row_size < 7 {
        return Err(FrozenError::corrupt("row_size too small to hold a row"));
    }
    if !is_row_start(bytes[0]) {
        return Err(FrozenError::corrupt("missing ROW_START sentinel"));
    }
    if !is_row_end(bytes[row_size - 1]) {
        return Err(FrozenError::corrupt("missing ROW_END sentinel"));
    }
    let parity_slot = &bytes[row_size - 3..row_size - 1];
    let expected = parity_hex(&bytes[..row_size - 3]);
    if parity_slot != expected {
        return Err(FrozenError::corrupt("parity mismatch"));
    }
    Ok(())
}

fn payload_bounds(row_size: usize, bytes: &[u8]) -> Result<(usize, usize), FrozenError> {
    // Payload begins at 2, ends at the first null byte before the padding
    // region, or at `row_size - 5` if there is no payload-terminating null
    // (a full-width payload).
    let search_end = row_size - 5;
    let payload_end = bytes[2..search_end]
        .iter()
        .position(|&b| b == NULL_PAD)
        .map(|p| p + 2)
        .unwrap_or(search_end);
    if bytes[payload_end..search_end].iter().any(|&b| b != NULL_PAD) {
        return Err(FrozenError::corrupt(
            "non-null byte found in the padding region",
        ));
    }
    Ok((2, payload_end))
}

/// A committed key/value row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub uuid: Uuid,
    pub value: Vec<u8>,
    pub(crate) start_control: u8,
    pub end_control: EndControl,
}

impl DataRow {
    pub(crate) fn timestamp_ms(&self) -> i64 {
        uuidv7_timestamp_ms(&self.uuid)
    }

    pub fn validate(&self, row_size: usize) -> Result<(), FrozenError> {
        if self.start_control != START_TRANSACTION && self.start_control != START_CONTINUE {
            return Err(FrozenError::corrupt("data row start_control must be T or R"));
        }
        if !self.end_control.is_valid_for_data_row() {
            return Err(FrozenError::corrupt(
                "data row end_control must not be NR or CS",
            ));
        }
        if matches!(self.end_control, EndControl::Rollback(n) | EndControl::SavepointRollback(n) if n > 9)
        {
            return Err(FrozenError::corrupt("rollback savepoint digit out of range"));
        }
        if UUID_BASE64_LEN + self.value.len() + 7 > row_size {
            return Err(FrozenError::invalid_input(
                "value too large for configured row_size",
            ));
        }
        validate_uuidv7(&self.uuid)?;
        Ok(())
    }

    pub fn marshal(&self, row_size: usize) -> Result<Vec<u8>, FrozenError> {
        self.validate(row_size)?;
        let mut out = vec![0u8; row_size];
        out[0] = ROW_START;
        out[1] = self.start_control;
        let encoded_uuid = encode_uuid(&self.uuid);
        out[2..2 + UUID_BASE64_LEN].copy_from_slice(&encoded_uuid);
        let value_start = 2 + UUID_BASE64_LEN;
        out[value_start..value_start + self.value.len()].copy_from_slice(&self.value);
        // out[value_start + value.len() .. row_size - 5] stays null.
        out[row_size - 5..row_size - 3].copy_from_slice(&self.end_control.encode());
        let parity = parity_hex(&out[..row_size - 3]);
        out[row_size - 3..row_size - 1].copy_from_slice(&parity);
        out[row_size - 1] = ROW_END;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, FrozenError> {
        let row_size = bytes.len();
        validate_frame(row_size, bytes)?;
        let start_control = bytes[1];
        if start_control != START_TRANSACTION && start_control != START_CONTINUE {
            return Err(FrozenError::corrupt("data row start_control must be T or R"));
        }
        let (start, end) = payload_bounds(row_size, bytes)?;
        if end - start < UUID_BASE64_LEN {
            return Err(FrozenError::corrupt("data row payload shorter than a uuid"));
        }
        let uuid = decode_uuid(&bytes[start..start + UUID_BASE64_LEN])?;
        let value = bytes[start + UUID_BASE64_LEN..end].to_vec();
        let end_control = EndControl::decode([bytes[row_size - 5], bytes[row_size - 4]])?;

        let row = DataRow {
            uuid,
            value,
            start_control,
            end_control,
        };
        row.validate(row_size)?;
        Ok(row)
    }
}

/// An empty transaction: begin-then-commit with no rows, or a rollback that
/// produced no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullRow;

impl NullRow {
    pub fn marshal(&self, row_size: usize) -> Result<Vec<u8>, FrozenError> {
        if row_size < 7 {
            return Err(FrozenError::corrupt("row_size too small to hold a row"));
        }
        let mut out = vec![0u8; row_size];
        out[0] = ROW_START;
        out[1] = START_TRANSACTION;
        let nil = encode_uuid(&Uuid::nil());
        out[2..2 + UUID_BASE64_LEN].copy_from_slice(&nil);
        out[row_size - 5..row_size - 3].copy_from_slice(&EndControl::Null.encode());
        let parity = parity_hex(&out[..row_size - 3]);
        out[row_size - 3..row_size - 1].copy_from_slice(&parity);
        out[row_size - 1] = ROW_END;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, FrozenError> {
        let row_size = bytes.len();
        validate_frame(row_size, bytes)?;
        if bytes[1] != START_TRANSACTION {
            return Err(FrozenError::corrupt("null row start_control must be T"));
        }
        let end_control = EndControl::decode([bytes[row_size - 5], bytes[row_size - 4]])?;
        if end_control != EndControl::Null {
            return Err(FrozenError::corrupt("null row end_control must be NR"));
        }
        let (start, end) = payload_bounds(row_size, bytes)?;
        if end - start != UUID_BASE64_LEN {
            return Err(FrozenError::corrupt("null row payload has unexpected length"));
        }
        let uuid = decode_uuid(&bytes[start..end])?;
        if !uuid.is_nil() {
            return Err(FrozenError::corrupt("null row payload must be the nil uuid"));
        }
        Ok(NullRow)
    }
}

/// A checksum row; its payload is `base64(crc32_ieee(block_bytes))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRow {
    pub crc: u32,
}

impl ChecksumRow {
    pub fn marshal(&self, row_size: usize) -> Result<Vec<u8>, FrozenError> {
        if row_size < 7 {
            return Err(FrozenError::corrupt("row_size too small to hold a row"));
        }
        let mut out = vec![0u8; row_size];
        out[0] = ROW_START;
        out[1] = START_CHECKSUM;
        let payload = crc_payload(self.crc);
        out[2..2 + payload.len()].copy_from_slice(&payload);
        out[row_size - 5..row_size - 3].copy_from_slice(&EndControl::Checksum.encode());
        let parity = parity_hex(&out[..row_size - 3]);
        out[row_size - 3..row_size - 1].copy_from_slice(&parity);
        out[row_size - 1] = ROW_END;
        Ok(out)
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self, FrozenError> {
        let row_size = bytes.len();
        validate_frame(row_size, bytes)?;
        if bytes[1] != START_CHECKSUM {
            return Err(FrozenError::corrupt("checksum row start_control must be C"));
        }
        let end_control = EndControl::decode([bytes[row_size - 5], bytes[row_size - 4]])?;
        if end_control != EndControl::Checksum {
            return Err(FrozenError::corrupt("checksum row end_control must be CS"));
        }
        let (start, end) = payload_bounds(row_size, bytes)?;
        if end - start != 8 {
            return Err(FrozenError::corrupt(
                "checksum row payload must be exactly 8 base64 characters",
            ));
        }
        let crc = decode_crc_payload(&bytes[start..end])?;
        Ok(ChecksumRow { crc })
    }
}

fn crc_payload(crc: u32) -> [u8; 8] {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let mut out = [0u8; 8];
    let written = STANDARD
        .encode_slice(crc.to_be_bytes(), &mut out)
        .expect("8-byte buffer always fits a 4-byte input");
    debug_assert_eq!(written, 8);
    out
}

fn decode_crc_payload(bytes: &[u8]) -> Result<u32, FrozenError> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    let mut raw = [0u8; 4];
    let written = STANDARD
        .decode_slice(bytes, &mut raw)
        .map_err(|e| FrozenError::corrupt(format!("checksum payload is not valid base64: {e}")))?;
    if written != 4 {
        return Err(FrozenError::corrupt(
            "checksum payload decoded to wrong length",
        ));
    }
    Ok(u32::from_be_bytes(raw))
}

/// The stage of an in-progress row's incremental emission (spec §4.3, §9:
/// "cyclic last-finalised + current partial shape").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartialState {
    /// Only `ROW_START` and `start_control` have been decided.
    WithStartControl,
    /// Key and value have been appended.
    WithPayload,
    /// A savepoint marker has been attached.
    WithSavepoint,
}

/// A row whose bytes have begun to be emitted to disk but whose
/// `end_control` has not yet been chosen. Exclusively owned by the active
/// transaction; never itself a file-format artefact.
#[derive(Debug, Clone)]
pub(crate) struct PartialDataRow {
    start_control: u8,
    uuid: Option<Uuid>,
    value: Option<Vec<u8>>,
    state: PartialState,
}

impl PartialDataRow {
    pub(crate) fn new(start_control: u8) -> Self {
        PartialDataRow {
            start_control,
            uuid: None,
            value: None,
            state: PartialState::WithStartControl,
        }
    }

    pub(crate) fn has_payload(&self) -> bool {
        !matches!(self.state, PartialState::WithStartControl)
    }

    pub(crate) fn has_savepoint(&self) -> bool {
        matches!(self.state, PartialState::WithSavepoint)
    }

    pub(crate) fn with_payload(mut self, uuid: Uuid, value: Vec<u8>) -> Self {
        debug_assert_eq!(self.state, PartialState::WithStartControl);
        self.uuid = Some(uuid);
        self.value = Some(value);
        self.state = PartialState::WithPayload;
        self
    }

    pub(crate) fn with_savepoint(mut self) -> Self {
        debug_assert_eq!(self.state, PartialState::WithPayload);
        self.state = PartialState::WithSavepoint;
        self
    }

    /// Bytes of this partial row that are already decided, regardless of the
    /// eventual `end_control`: the prefix every possible finalisation of
    /// this row shares. A savepoint marker is never part of this prefix —
    /// its true on-disk position is the fixed `end_control` slot at
    /// `row_size-5`, not the byte immediately after the payload, so
    /// recording a savepoint only changes in-memory state
    /// (`has_savepoint`) and contributes no incremental byte. It reaches
    /// disk only as part of the full row `finalize_as`/`marshal` produces.
    pub(crate) fn emitted_prefix(&self) -> Vec<u8> {
        let mut out = vec![ROW_START, self.start_control];
        if let (Some(uuid), Some(value)) = (&self.uuid, &self.value) {
            out.extend_from_slice(&encode_uuid(uuid));
            out.extend_from_slice(value);
        }
        out
    }

    /// Finalises this partial row as a complete `DataRow` carrying
    /// `end_control`. The caller chooses the terminal `Rn`/`Sn`/`TC`/`RE`
    /// variant per the transaction state machine in spec §4.5.
    pub(crate) fn finalize_as(self, end_control: EndControl) -> DataRow {
        debug_assert!(
            self.has_payload(),
            "only a partial row that has received a payload can be finalised"
        );
        if self.has_savepoint() {
            debug_assert!(
                matches!(
                    end_control,
                    EndControl::SavepointCommit
                        | EndControl::SavepointContinue
                        | EndControl::SavepointRollback(_)
                ),
                "a savepoint-marked row must finalise with an S-prefixed end_control"
            );
        }
        DataRow {
            uuid: self.uuid.expect("payload present"),
            value: self.value.expect("payload present"),
            start_control: self.start_control,
            end_control,
        }
    }
}
