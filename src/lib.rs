//! frozenDB: an append-only, single-file embedded database engine.
//!
//! A database is a single `.fdb` file: a 64-byte header, followed by
//! fixed-width rows keyed by UUIDv7 and periodically interleaved with
//! integrity-checksum rows. Writes are grouped into transactions
//! (`Database::begin_transaction`) that support savepoints and partial
//! rollback; reads resolve a key to a row index through a pluggable
//! [`FinderStrategy`] and then read that one row directly.
//!
//! See `DESIGN.md` in the repository root for the grounding of each module.

mod config;
mod error;
mod file_manager;
mod finder;
mod fuzzy;
mod header;
mod open;
mod primitives;
mod row;
mod transaction;
mod validate;

use std::path::Path;
use std::sync::Arc;

pub use error::{FrozenError, Result};
pub use header::Header;
pub use open::{AppendOnlyAttribute, FinderStrategy, HostCapabilities, NoAppendOnlyAttribute};
pub use row::{ChecksumRow, DataRow, EndControl, NullRow};
pub use transaction::Transaction;

use file_manager::FileManager;
use finder::Finder;

/// A handle to one open `.fdb` file. Read-only handles support `get` and the
/// transaction-boundary queries; read-write handles additionally support
/// `begin_transaction`, of which at most one may be open at a time.
pub struct Database {
    header: Header,
    file_manager: Arc<FileManager>,
    finder: Arc<Finder>,
    row_size: u32,
    skew_ms: u64,
}

impl Database {
    /// Runs the Create sequence (spec §4.8) and opens the freshly created
    /// file for writing with the given Finder strategy.
    pub fn create(
        path: impl AsRef<Path>,
        row_size: u32,
        skew_ms: u64,
        caps: &HostCapabilities,
        attribute: &dyn AppendOnlyAttribute,
        strategy: FinderStrategy,
    ) -> Result<Self> {
        let path = path.as_ref();
        open::create(path, row_size, skew_ms, caps, attribute)?;
        Self::open_read_write(path, strategy)
    }

    /// Opens an existing file read-only. No lock is acquired.
    pub fn open_read_only(path: impl AsRef<Path>, strategy: FinderStrategy) -> Result<Self> {
        Self::open(path.as_ref(), false, strategy)
    }

    /// Opens an existing file read-write, acquiring the advisory lock.
    pub fn open_read_write(path: impl AsRef<Path>, strategy: FinderStrategy) -> Result<Self> {
        Self::open(path.as_ref(), true, strategy)
    }

    fn open(path: &Path, write: bool, strategy: FinderStrategy) -> Result<Self> {
        let (header, file_manager) = open::open(path, write)?;
        let file_manager = Arc::new(file_manager);
        let finder = Arc::new(open::build_finder(strategy, &file_manager, &header)?);
        Ok(Database {
            header,
            file_manager,
            finder,
            row_size: header.row_size,
            skew_ms: header.skew_ms,
        })
    }

    /// The database's header, as parsed at open/create time.
    pub fn header(&self) -> Header {
        self.header
    }

    /// Starts a new transaction. Fails if one is already open on this
    /// handle, or on any other handle sharing the same file manager.
    pub fn begin_transaction(&self) -> Result<Transaction<'_>> {
        transaction::Transaction::begin(
            &self.file_manager,
            Arc::clone(&self.finder),
            self.row_size,
            self.skew_ms,
        )
    }

    /// Looks up the row index for `key`.
    pub fn index_of(&self, key: &uuid::Uuid) -> Result<u64> {
        self.finder.get_index(key)
    }

    /// Reads the value stored under `key`.
    pub fn get(&self, key: &uuid::Uuid) -> Result<DataRow> {
        let index = self.finder.get_index(key)?;
        self.read_data_row(index)
    }

    /// The row index at which the transaction containing `index` begins.
    pub fn transaction_start_index(&self, index: u64) -> Result<u64> {
        self.finder.get_transaction_start(index)
    }

    /// The row index at which the transaction containing `index` ends.
    /// Fails with `TransactionActiveError` if it has not yet committed or
    /// rolled back.
    pub fn transaction_end_index(&self, index: u64) -> Result<u64> {
        self.finder.get_transaction_end(index)
    }

    /// The highest UUIDv7 timestamp, in milliseconds, observed among all
    /// `DataRow`s appended so far.
    pub fn max_timestamp(&self) -> i64 {
        self.finder.max_timestamp()
    }

    /// Closes the underlying file manager, tombstoning any in-flight
    /// writer and releasing the advisory lock.
    pub fn close(&self) {
        self.file_manager.close();
    }

    fn read_data_row(&self, index: u64) -> Result<DataRow> {
        let offset = finder::row_offset(index, self.row_size as u64);
        let bytes = self.file_manager.read(offset, self.row_size as usize)?;
        DataRow::unmarshal(&bytes)
    }
}
