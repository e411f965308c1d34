//! Compile-time constants shared across the engine.

/// Number of data/null rows between checksum rows.
pub(crate) const CHECKSUM_INTERVAL: u64 = 10_000;

/// Number of rows (checksum row included) that trigger a new checksum row.
pub(crate) const CHECKSUM_BLOCK_ROWS: u64 = CHECKSUM_INTERVAL + 1;

pub(crate) const MIN_ROW_SIZE: u32 = 128;
pub(crate) const MAX_ROW_SIZE: u32 = 65536;
pub(crate) const MAX_SKEW_MS: u64 = 86_400_000;
pub const HEADER_SIZE: usize = 64;
pub(crate) const MAX_ROWS_PER_TRANSACTION: usize = 100;
pub(crate) const MAX_SAVEPOINTS_PER_TRANSACTION: u8 = 9;

pub(crate) const ROW_START: u8 = 0x1F;
pub(crate) const ROW_END: u8 = 0x0A;
pub(crate) const NULL_PAD: u8 = 0x00;

/// Required filename suffix for database files.
pub(crate) const FILE_EXTENSION: &str = "fdb";
