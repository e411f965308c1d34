//! Builds complete key→index and transaction-boundary maps during
//! construction by scanning the whole file once. All lookups are O(1)
//! after that (spec §4.6).

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use super::{is_checksum_index, row_offset, AddedRow, RowIndex};
use crate::error::FrozenError;
use crate::file_manager::FileManager;
use crate::row::{ChecksumRow, NullRow, DataRow, START_TRANSACTION};

enum ScannedRow {
    Checksum,
    Null,
    Data(DataRow),
}

fn classify(bytes: &[u8]) -> Result<ScannedRow, FrozenError> {
    match bytes.get(1) {
        Some(b'C') => {
            ChecksumRow::unmarshal(bytes)?;
            Ok(ScannedRow::Checksum)
        }
        Some(b'T') if NullRow::unmarshal(bytes).is_ok() => Ok(ScannedRow::Null),
        _ => Ok(ScannedRow::Data(DataRow::unmarshal(bytes)?)),
    }
}

struct State {
    uuid_to_index: HashMap<Uuid, RowIndex>,
    transaction_start: Vec<Option<RowIndex>>,
    transaction_end: Vec<Option<RowIndex>>,
    max_timestamp: i64,
    total_rows: RowIndex,
    open_transaction_start: Option<RowIndex>,
}

pub(crate) struct InMemoryFinder {
    state: RwLock<State>,
}

impl InMemoryFinder {
    pub(crate) fn build(
        file_manager: &FileManager,
        row_size: u64,
    ) -> Result<Self, FrozenError> {
        let size = file_manager.size();
        let mut uuid_to_index = HashMap::new();
        let mut transaction_start = Vec::new();
        let mut transaction_end = Vec::new();
        let mut max_timestamp = i64::MIN;
        let mut open_transaction_start: Option<RowIndex> = None;

        let mut index: RowIndex = 0;
        loop {
            let offset = row_offset(index, row_size);
            if offset + row_size > size {
                break;
            }
            let bytes = file_manager.read(offset, row_size as usize)?;
            match classify(&bytes)? {
                ScannedRow::Checksum => {
                    // A checksum row may legally interrupt a still-open
                    // transaction (spec §4.5: insertion is checked after
                    // *any* row completes, not only at commit/rollback), so
                    // `open_transaction_start` is left untouched here.
                    transaction_start.push(None);
                    transaction_end.push(None);
                }
                ScannedRow::Null => {
                    transaction_start.push(Some(index));
                    transaction_end.push(Some(index));
                }
                ScannedRow::Data(row) => {
                    if row.start_control == START_TRANSACTION {
                        open_transaction_start = Some(index);
                    }
                    let start = open_transaction_start.ok_or_else(|| {
                        FrozenError::corrupt("data row continuation without an open transaction")
                    })?;
                    transaction_start.push(Some(start));
                    transaction_end.push(None);
                    uuid_to_index.insert(row.uuid, index);
                    max_timestamp = max_timestamp.max(row.timestamp_ms());
                    if row.end_control.is_terminal() {
                        for slot in transaction_end
                            .iter_mut()
                            .take(index as usize + 1)
                            .skip(start as usize)
                        {
                            *slot = Some(index);
                        }
                        open_transaction_start = None;
                    }
                }
            }
            index += 1;
        }

        Ok(InMemoryFinder {
            state: RwLock::new(State {
                uuid_to_index,
                transaction_start,
                transaction_end,
                max_timestamp: if max_timestamp == i64::MIN {
                    0
                } else {
                    max_timestamp
                },
                total_rows: index,
                open_transaction_start,
            }),
        })
    }

    pub(crate) fn get_index(&self, key: &Uuid) -> Result<RowIndex, FrozenError> {
        crate::primitives::validate_uuidv7(key)?;
        let state = self.state.read();
        state
            .uuid_to_index
            .get(key)
            .copied()
            .ok_or(FrozenError::KeyNotFound)
    }

    pub(crate) fn get_transaction_start(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        let state = self.state.read();
        self.validate_index(&state, index)?;
        state.transaction_start[index as usize]
            .ok_or_else(|| FrozenError::corrupt("row has no recorded transaction start"))
    }

    pub(crate) fn get_transaction_end(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        let state = self.state.read();
        self.validate_index(&state, index)?;
        state.transaction_end[index as usize].ok_or(FrozenError::TransactionActive)
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
        match row {
            AddedRow::Checksum => {
                state.transaction_start.push(None);
                state.transaction_end.push(None);
            }
            AddedRow::Null => {
                state.transaction_start.push(Some(index));
                state.transaction_end.push(Some(index));
            }
            AddedRow::Data(row) => {
                if row.start_control == START_TRANSACTION {
                    state.open_transaction_start = Some(index);
                }
                let start = state.open_transaction_start.ok_or_else(|| {
                    FrozenError::invalid_input("row added without an open transaction")
                })?;
                state.transaction_start.push(Some(start));
                state.transaction_end.push(None);
                state.uuid_to_index.insert(row.uuid, index);
                state.max_timestamp = state.max_timestamp.max(row.timestamp_ms());
                if row.end_control.is_terminal() {
                    for i in start..=index {
                        state.transaction_end[i as usize] = Some(index);
                    }
                    state.open_transaction_start = None;
                }
            }
        }
        state.total_rows += 1;
        Ok(())
    }

    fn validate_index(&self, state: &State, index: RowIndex) -> Result<(), FrozenError> {
        if is_checksum_index(index) {
            return Err(FrozenError::invalid_input(
                "index refers to a checksum row slot",
            ));
        }
        if index >= state.total_rows {
            return Err(FrozenError::invalid_input("index beyond known rows"));
        }
        Ok(())
    }
}
