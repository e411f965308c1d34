//! Maps keys and transactional positions to row offsets (spec §4.6).
//!
//! Two concrete strategies share one interface: [`InMemoryFinder`] builds
//! complete maps up front for O(1) lookups; [`SimpleFinder`] keeps only the
//! minimum state and answers queries by scanning the file. The open path
//! (§4.8) picks a strategy at construction time; it is not dynamic
//! thereafter, so a small enum dispatches rather than a trait object.

mod in_memory;
mod simple;

pub(crate) use in_memory::InMemoryFinder;
pub(crate) use simple::SimpleFinder;

use uuid::Uuid;

use crate::error::FrozenError;
use crate::row::DataRow;

/// Zero-based count of rows after the header. The byte offset is
/// `HEADER_SIZE + row_index * row_size`.
pub(crate) type RowIndex = u64;

/// A row that was just appended, passed to `on_row_added` so a finder's
/// maps stay current without rescanning the file.
pub(crate) enum AddedRow<'a> {
    Data(&'a DataRow),
    Null,
    Checksum,
}

/// The strategy-selecting entry point used by the rest of the engine. Both
/// concrete strategies guard their internal maps with a reader/writer lock:
/// `on_row_added` is exclusive, queries are shared (spec §4.6, last
/// paragraph).
pub(crate) enum Finder {
    InMemory(InMemoryFinder),
    Simple(SimpleFinder),
}

impl Finder {
    pub(crate) fn get_index(&self, key: &Uuid) -> Result<RowIndex, FrozenError> {
        match self {
            Finder::InMemory(f) => f.get_index(key),
            Finder::Simple(f) => f.get_index(key),
        }
    }

    pub(crate) fn get_transaction_start(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        match self {
            Finder::InMemory(f) => f.get_transaction_start(index),
            Finder::Simple(f) => f.get_transaction_start(index),
        }
    }

    pub(crate) fn get_transaction_end(&self, index: RowIndex) -> Result<RowIndex, FrozenError> {
        match self {
            Finder::InMemory(f) => f.get_transaction_end(index),
            Finder::Simple(f) => f.get_transaction_end(index),
        }
    }

    pub(crate) fn max_timestamp(&self) -> i64 {
        match self {
            Finder::InMemory(f) => f.max_timestamp(),
            Finder::Simple(f) => f.max_timestamp(),
        }
    }

    pub(crate) fn on_row_added(
        &self,
        index: RowIndex,
        row: AddedRow<'_>,
    ) -> Result<(), FrozenError> {
        match self {
            Finder::InMemory(f) => f.on_row_added(index, row),
            Finder::Simple(f) => f.on_row_added(index, row),
        }
    }
}

/// Index at which slot `n` (0-based) holds a checksum row: 0, 10_001,
/// 20_002, ...
pub(crate) fn is_checksum_index(index: RowIndex) -> bool {
    index % crate::config::CHECKSUM_BLOCK_ROWS == 0
}

pub(crate) fn row_offset(index: RowIndex, row_size: u64) -> u64 {
    crate::config::HEADER_SIZE as u64 + index * row_size
}
