//! Keeps only `max_timestamp` and the file size; answers key lookups with a
//! fuzzy binary search over the file and transaction-boundary queries by
//! scanning outward (spec §4.6).

use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::{is_checksum_index, row_offset, AddedRow, RowIndex};
use crate::error::FrozenError;
use crate::file_manager::FileManager;
use crate::fuzzy::fuzzy_search;
use crate::primitives::{uuidv7_timestamp_ms, validate_uuidv7};
use crate::row::{ChecksumRow, DataRow, NullRow};

enum ScannedRow {
    Checksum,
    Null,
    Data(DataRow),
}

fn read_row(
    file_manager: &FileManager,
    row_size: u64,
    index: RowIndex,
) -> Result<ScannedRow, FrozenError> {
    let bytes = file_manager.read(row_offset(index, row_size), row_size as usize)?;
    match bytes.get(1) {
        Some(b'C') => {
            ChecksumRow::unmarshal(&bytes)?;
            Ok(ScannedRow::Checksum)
        }
        Some(b'T') if NullRow::unmarshal(&bytes).is_ok() => Ok(ScannedRow::Null),
        _ => Ok(ScannedRow::Data(DataRow::unmarshal(&bytes)?)),
    }
}

struct State {
    max_timestamp: i64,
    total_rows: RowIndex,
}

pub(crate) struct SimpleFinder {
    file_manager: Arc<FileManager>,
    row_size: u64,
    skew_ms: u64,
    state: RwLock<State>,
}

impl SimpleFinder {
    pub(crate) fn build(
        file_manager: Arc<FileManager>,
        row_size: u64,
        skew_ms: u64,
    ) -> Result<Self, FrozenError> {
        let size = file_manager.size();
        let total_rows = (size.saturating_sub(crate::config::HEADER_SIZE as u64)) / row_size;

        // A single backward scan recovers `max_timestamp` without keeping
        // any per-row state; this mirrors the "keep only the minimum"
        // design in spec §4.6.
        let mut max_timestamp = i64::MIN;
        let mut index = total_rows;
        while index > 0 {
            index -= 1;
            if let ScannedRow::Data(row) = read_row(&file_manager, row_size, index)? {
                max_timestamp = max_timestamp.max(row.timestamp_ms());
            }
        }
        if max_timestamp == i64::MIN {
            max_timestamp = 0;
        }

        Ok(SimpleFinder {
            file_manager,
            row_size,
            skew_ms,
            state: RwLock::new(State {
                max_timestamp,
                total_rows,
            }),
        })
    }

    /// Approximates the timestamp at `index` for the purposes of the fuzzy
    /// binary search: the real timestamp for a `DataRow`, or the nearest
    /// preceding `DataRow`'s timestamp for a `NullRow`/`ChecksumRow`, which
    /// keeps the sequence within the search's skew tolerance at the point
    /// where it is not truly keyed.
    fn approx_timestamp_at(&self, index: RowIndex) -> Result<i64, FrozenError> {
        let mut i = index;
        loop {
            match read_row(&self.file_manager, self.row_size, i)? {
                ScannedRow::Data(row) => return Ok(row.timestamp_ms()),
                _ if i == 0 => return Ok(i64::MIN),
                _ => i -= 1,
            }
        }
    }

    fn uuid_at(&self, index: RowIndex) -> Result<Option<Uuid>, FrozenError> {
        match read_row(&self.file_manager, self.row_size, index)? {
            ScannedRow::Data(row) => Ok(Some(row.uuid)),
            _ => Ok(None),
        }
    }

    pub(crate) fn get_index(&self, key: &Uuid) -> Result<RowIndex, FrozenError> {
        validate_uuidv7(key)?;
        let target_ts = uuidv7_timestamp_ms(key);
        let total_rows = self.state.read().total_rows;

        let found = fuzzy_search(target_ts, self.skew_ms, total_rows, |i| {
            self.approx_timestamp_at(i)
        })?;

        if self.uuid_at(found)? == Some(*key) {
            return Ok(found);
        }

        // The binary search can land on a non-keyed row (or a data row
        // that merely shares a timestamp) when it is approximated by a
        // neighbour's timestamp; probe the local cluster for the exact key.
        let skew = self.skew_ms as i64;
        let mut i = found;
        loop {
            if self.uuid_at(i)? == Some(*key) {
                return Ok(i);
            }
            if i == 0 {
                break;
            }
            i -= 1;
            if (self.approx_timestamp_at(i)? - target_ts).abs() > skew {
                break;
            }
        }
        let mut i = found + 1;
        while i < total_rows {
            if (self.approx_timestamp_at(i)? - target_ts).abs() > skew {
                break;
            }
            if self.uuid_at(i)? == Some(*key) {
                return Ok(i);
            }
            i += 1;
        }

        Err(FrozenError::KeyNotFound)
    }

    pub(crate) fn get_transaction_start(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        self.validate_index(index)?;
        let mut i = index;
        loop {
            if !is_checksum_index(i) {
                match read_row(&self.file_manager, self.row_size, i)? {
                    ScannedRow::Null => return Ok(i),
                    ScannedRow::Data(row) if row.start_control == crate::row::START_TRANSACTION => {
                        return Ok(i)
                    }
                    _ => {}
                }
            }
            if i == 0 {
                return Err(FrozenError::corrupt(
                    "scanned back to row 0 without finding a transaction start",
                ));
            }
            i -= 1;
        }
    }

    pub(crate) fn get_transaction_end(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        let total_rows = self.validate_index(index)?;
        let mut i = index;
        loop {
            if !is_checksum_index(i) {
                match read_row(&self.file_manager, self.row_size, i)? {
                    ScannedRow::Null => return Ok(i),
                    ScannedRow::Data(row) if row.end_control.is_terminal() => return Ok(i),
                    _ => {}
                }
            }
            i += 1;
            if i >= total_rows {
                return Err(FrozenError::TransactionActive);
            }
        }
    }

    pub(crate) fn max_timestamp(&self) -> i64 {
        self.state.read().max_timestamp
    }

    pub(crate) fn on_row_added(
        &self,
        index: RowIndex,
        row: AddedRow<'_>,
    ) -> Result<(), FrozenError> {
        let mut state = self.state.write();
        if index != state.total_rows {
            return Err(FrozenError::invalid_input(
                "on_row_added called out of order with the finder's row count",
            ));
        }
        if let AddedRow::Data(row) = row {
            state.max_timestamp = state.max_timestamp.max(row.timestamp_ms());
        }
        state.total_rows += 1;
        Ok(())
    }

    fn validate_index(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        if is_checksum_index(index) {
            return Err(FrozenError::invalid_input(
                "index refers to a checksum row slot",
            ));
        }
        let total_rows = self.state.read().total_rows;
        if index >= total_rows {
            return Err(FrozenError::invalid_input("index beyond known rows"));
        }
        Ok(total_rows)
    }
}
