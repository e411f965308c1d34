//! The transaction state machine: Begin / AddRow / Savepoint / Rollback /
//! Commit, incremental row emission, and checksum-block insertion
//! (spec §4.5).

use std::sync::Arc;

use tracing::{trace, warn};
use uuid::Uuid;

use crate::config::{
    HEADER_SIZE, MAX_ROWS_PER_TRANSACTION, MAX_SAVEPOINTS_PER_TRANSACTION,
};
use crate::error::{FrozenError, Result};
use crate::file_manager::{FileManager, WriterHandle};
use crate::finder::{is_checksum_index, row_offset, AddedRow, Finder, RowIndex};
use crate::primitives::{uuidv7_timestamp_ms, validate_uuidv7};
use crate::row::{
    ChecksumRow, EndControl, NullRow, PartialDataRow, START_CONTINUE, START_TRANSACTION,
};

/// Bookkeeping for an in-progress transaction. Only present while the
/// transaction is in the `Active` state (spec §3: Inactive/Active/Committed).
struct ActiveState {
    partial: PartialDataRow,
    row_bytes_written: usize,
    /// Count of `AddRow` calls so far, enforcing the 100-row ceiling.
    rows_added: usize,
    savepoint_count: u8,
    max_ts: i64,
    /// Row index the current partial occupies, once its first byte lands.
    current_index: RowIndex,
    /// Index the *next* row (partial or checksum) will occupy.
    next_index: RowIndex,
    /// Keys that are part of the transaction's logical result: every key
    /// added, with the suffix discarded by a later `Rollback` removed. The
    /// underlying bytes stay on disk and in the Finder regardless (append-
    /// only; spec invariant 4) — this is bookkeeping for callers, grounded
    /// in spec §8 E3's "Committed rows (visible via `committed_rows`)".
    committed_keys: Vec<Uuid>,
    /// `committed_keys.len()` recorded at each `Savepoint()` call, indexed
    /// 0-based by savepoint number minus one.
    savepoint_marks: Vec<usize>,
}

enum State {
    Active(ActiveState),
    Committed,
}

/// One open write session against a [`Database`](crate::Database). At most
/// one exists per file manager at a time (spec §5): `Database::begin_transaction`
/// fails if a prior `Transaction` has not yet been dropped via `commit`,
/// `rollback`, or simply going out of scope.
pub struct Transaction<'a> {
    file_manager: &'a FileManager,
    writer: Option<WriterHandle<'a>>,
    finder: Arc<Finder>,
    row_size: u32,
    skew_ms: u64,
    state: State,
    tombstoned: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(
        file_manager: &'a FileManager,
        finder: Arc<Finder>,
        row_size: u32,
        skew_ms: u64,
    ) -> Result<Self> {
        let writer = file_manager.set_writer()?;
        let size = writer.size();
        let next_index = (size - HEADER_SIZE as u64) / row_size as u64;

        let partial = PartialDataRow::new(START_TRANSACTION);
        let prefix = partial.emitted_prefix();
        writer.append(prefix.clone())?;

        Ok(Transaction {
            file_manager,
            writer: Some(writer),
            finder,
            row_size,
            skew_ms,
            state: State::Active(ActiveState {
                partial,
                row_bytes_written: prefix.len(),
                rows_added: 0,
                savepoint_count: 0,
                max_ts: i64::MIN,
                current_index: next_index,
                next_index,
                committed_keys: Vec::new(),
                savepoint_marks: Vec::new(),
            }),
            tombstoned: false,
        })
    }

    /// Appends one key/value pair to the open transaction.
    pub fn add_row(&mut self, uuid: Uuid, value: Vec<u8>) -> Result<()> {
        self.guard(|tx| tx.add_row_inner(uuid, value))
    }

    fn add_row_inner(&mut self, uuid: Uuid, value: Vec<u8>) -> Result<()> {
        if value.is_empty() {
            return Err(FrozenError::invalid_input("value must not be empty"));
        }
        if crate::primitives::UUID_BASE64_LEN + value.len() + 7 > self.row_size as usize {
            return Err(FrozenError::invalid_input(
                "value too large for configured row_size",
            ));
        }
        validate_uuidv7(&uuid)?;

        let rows_added = self.active()?.rows_added;
        if rows_added >= MAX_ROWS_PER_TRANSACTION {
            return Err(FrozenError::invalid_input(
                "transaction has already reached its row ceiling",
            ));
        }

        let target_ts = uuidv7_timestamp_ms(&uuid);
        let tx_max_ts = self.active()?.max_ts;
        let max_seen = self.finder.max_timestamp().max(tx_max_ts);
        if target_ts + self.skew_ms as i64 <= max_seen {
            return Err(FrozenError::key_ordering(format!(
                "key timestamp {target_ts} does not exceed max_seen {max_seen} by more than skew_ms"
            )));
        }

        let has_payload = self.active()?.partial.has_payload();
        if !has_payload {
            self.update_partial(|p| p.with_payload(uuid, value))?;
        } else {
            let has_savepoint = self.active()?.partial.has_savepoint();
            let end_control = if has_savepoint {
                EndControl::SavepointContinue
            } else {
                EndControl::Continue
            };
            self.finalize_current(end_control)?;
            {
                let active = self.active_mut()?;
                active.partial = PartialDataRow::new(START_CONTINUE);
                active.row_bytes_written = 0;
                active.current_index = active.next_index;
            }
            self.update_partial(|p| p.with_payload(uuid, value))?;
        }

        let rows_added = {
            let active = self.active_mut()?;
            active.max_ts = active.max_ts.max(target_ts);
            active.rows_added += 1;
            active.committed_keys.push(uuid);
            active.rows_added
        };
        trace!(rows_added, "row added to transaction");
        Ok(())
    }

    /// Marks the current row as a rollback point. Requires at least one
    /// `add_row` call since the last finalised row.
    pub fn savepoint(&mut self) -> Result<()> {
        self.guard(|tx| tx.savepoint_inner())
    }

    fn savepoint_inner(&mut self) -> Result<()> {
        {
            let active = self.active()?;
            if !active.partial.has_payload() {
                return Err(FrozenError::invalid_action(
                    "a savepoint requires at least one data row in the current partial",
                ));
            }
            if active.savepoint_count >= MAX_SAVEPOINTS_PER_TRANSACTION {
                return Err(FrozenError::invalid_action(
                    "transaction has already reached its savepoint ceiling",
                ));
            }
        }
        self.update_partial(PartialDataRow::with_savepoint)?;
        let active = self.active_mut()?;
        active.savepoint_count += 1;
        active.savepoint_marks.push(active.committed_keys.len());
        Ok(())
    }

    /// Rolls back to savepoint `n` (0 means "the start of the transaction")
    /// and ends the transaction.
    pub fn rollback(&mut self, n: u8) -> Result<()> {
        self.guard(|tx| tx.rollback_inner(n))
    }

    fn rollback_inner(&mut self, n: u8) -> Result<()> {
        let savepoint_count = self.active()?.savepoint_count;
        if n > savepoint_count {
            return Err(FrozenError::invalid_input(format!(
                "rollback target {n} exceeds savepoint count {savepoint_count}"
            )));
        }

        if self.active()?.partial.has_payload() {
            let has_savepoint = self.active()?.partial.has_savepoint();
            let end_control = if has_savepoint {
                EndControl::SavepointRollback(n)
            } else {
                EndControl::Rollback(n)
            };
            self.finalize_current(end_control)?;
        } else {
            self.finalize_as_null()?;
        }

        let active = self.active_mut()?;
        let truncate_to = if n == 0 {
            0
        } else {
            active.savepoint_marks[(n - 1) as usize]
        };
        active.committed_keys.truncate(truncate_to);

        self.end_transaction();
        Ok(())
    }

    /// Commits the transaction, detaching the writer so a later transaction
    /// may attach its own.
    pub fn commit(&mut self) -> Result<()> {
        self.guard(|tx| tx.commit_inner())
    }

    fn commit_inner(&mut self) -> Result<()> {
        if self.active()?.partial.has_payload() {
            let has_savepoint = self.active()?.partial.has_savepoint();
            let end_control = if has_savepoint {
                EndControl::SavepointCommit
            } else {
                EndControl::Commit
            };
            self.finalize_current(end_control)?;
        } else {
            self.finalize_as_null()?;
        }
        self.end_transaction();
        Ok(())
    }

    /// Keys visible as this transaction's logical result, after accounting
    /// for any rollback. Meaningless while the transaction is still active.
    pub fn committed_rows(&self) -> &[Uuid] {
        match &self.state {
            State::Active(active) => &active.committed_keys,
            State::Committed => &[],
        }
    }

    fn active(&self) -> Result<&ActiveState> {
        match &self.state {
            State::Active(a) => Ok(a),
            State::Committed => Err(FrozenError::invalid_action(
                "transaction has already ended",
            )),
        }
    }

    fn active_mut(&mut self) -> Result<&mut ActiveState> {
        match &mut self.state {
            State::Active(a) => Ok(a),
            State::Committed => Err(FrozenError::invalid_action(
                "transaction has already ended",
            )),
        }
    }

    fn writer(&self) -> Result<&WriterHandle<'a>> {
        self.writer
            .as_ref()
            .ok_or_else(|| FrozenError::invalid_action("transaction has no attached writer"))
    }

    /// Runs `f`, tombstoning the transaction on any error (spec §4.5
    /// "Tombstoning") and rejecting all further calls once tombstoned.
    fn guard<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.tombstoned {
            return Err(FrozenError::Tombstoned);
        }
        let result = f(self);
        if let Err(ref e) = result {
            // Only a failed write (or the corruption it can uncover) leaves
            // the transaction in an indeterminate byte position; plain
            // precondition/input rejections are safe to retry (spec §4.5
            // "Tombstoning": "any failed write", not any failed call).
            if matches!(
                e,
                FrozenError::Write { .. } | FrozenError::CorruptDatabase { .. } | FrozenError::Tombstoned
            ) {
                self.tombstoned = true;
                warn!("transaction tombstoned after a failed write");
            }
        }
        result
    }

    /// Applies `f` to the active partial, submits the newly decided suffix
    /// of its `emitted_prefix()`, and advances `row_bytes_written` — the
    /// incremental-emission contract in spec §4.5. Marking a savepoint
    /// changes only in-memory state and contributes no bytes to
    /// `emitted_prefix()` (its marker's disk position is fixed by
    /// `row_size`, decided only at finalisation), so this is a no-op write
    /// in that case.
    fn update_partial<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(PartialDataRow) -> PartialDataRow,
    {
        let active = self.active_mut()?;
        let partial = std::mem::replace(&mut active.partial, PartialDataRow::new(0));
        active.partial = f(partial);
        let prefix = active.partial.emitted_prefix();
        let written = active.row_bytes_written;
        let suffix = prefix[written..].to_vec();
        if !suffix.is_empty() {
            self.writer()?.append(suffix)?;
            self.active_mut()?.row_bytes_written = prefix.len();
        }
        Ok(())
    }

    /// Finalises the active partial as a complete `DataRow` with
    /// `end_control`, submits the remaining bytes, notifies the finder, and
    /// runs the checksum-block check.
    fn finalize_current(&mut self, end_control: EndControl) -> Result<()> {
        let active = self.active_mut()?;
        let partial = std::mem::replace(&mut active.partial, PartialDataRow::new(0));
        let row = partial.finalize_as(end_control);
        let bytes = row.marshal(self.row_size as usize)?;
        let written = self.active()?.row_bytes_written;
        self.writer()?.append(bytes[written..].to_vec())?;

        let index = self.active()?.current_index;
        self.finder.on_row_added(index, AddedRow::Data(&row))?;
        let active = self.active_mut()?;
        active.row_bytes_written = bytes.len();
        active.next_index = index + 1;

        self.maybe_insert_checksum()?;
        Ok(())
    }

    /// Finalises the active (payload-less) partial as a `NullRow`: the
    /// empty-transaction / no-op-rollback case (spec §4.5 Commit/Rollback
    /// postconditions; NullRow's meaning per the GLOSSARY).
    fn finalize_as_null(&mut self) -> Result<()> {
        let bytes = NullRow.marshal(self.row_size as usize)?;
        let written = self.active()?.row_bytes_written;
        self.writer()?.append(bytes[written..].to_vec())?;

        let index = self.active()?.current_index;
        self.finder.on_row_added(index, AddedRow::Null)?;
        let active = self.active_mut()?;
        active.next_index = index + 1;

        self.maybe_insert_checksum()?;
        Ok(())
    }

    /// After any row completes, checks whether exactly 10_001 rows have
    /// accumulated since the last checksum row (itself included) and, if
    /// so, validates and appends a new one (spec §4.5 "Checksum block
    /// insertion"). This can fire in the middle of a still-open
    /// transaction, not only at its boundary.
    fn maybe_insert_checksum(&mut self) -> Result<()> {
        let next_index = self.active()?.next_index;
        if !is_checksum_index(next_index) {
            return Ok(());
        }

        let block_rows = crate::config::CHECKSUM_BLOCK_ROWS;
        let block_start_index = next_index - block_rows;
        let block_start_offset = row_offset(block_start_index, self.row_size as u64);
        let block_len = block_rows * self.row_size as u64;

        let block_bytes = self
            .file_manager
            .read(block_start_offset, block_len as usize)?;
        self.validate_checksum_block(&block_bytes)?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&block_bytes);
        let crc = hasher.finalize();
        let checksum_row = ChecksumRow { crc }.marshal(self.row_size as usize)?;
        self.writer()?.append(checksum_row)?;

        self.finder.on_row_added(next_index, AddedRow::Checksum)?;
        let active = self.active_mut()?;
        active.next_index = next_index + 1;
        active.current_index = active.next_index;
        active.row_bytes_written = 0;
        Ok(())
    }

    fn validate_checksum_block(&self, block_bytes: &[u8]) -> Result<()> {
        let row_size = self.row_size as usize;
        let rows = block_bytes.chunks_exact(row_size);
        for (i, row) in rows.enumerate() {
            let is_checksum_row = row.get(1) == Some(&b'C');
            if i == 0 && !is_checksum_row {
                return Err(FrozenError::corrupt(
                    "checksum block does not begin with a ChecksumRow",
                ));
            }
            if i != 0 && is_checksum_row {
                return Err(FrozenError::corrupt(
                    "checksum block contains a second ChecksumRow",
                ));
            }
        }
        Ok(())
    }

    fn end_transaction(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.detach();
        }
        self.state = State::Committed;
    }
}
