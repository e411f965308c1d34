//! The closed error taxonomy described in spec §7.
//!
//! One variant per error kind; each carries a short, stable message and, where
//! a wrapped cause exists, the underlying error via `snafu`'s `source`
//! support.

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FrozenError {
    /// Argument out of range, malformed but never persisted.
    #[snafu(display("invalid input: {message}"))]
    InvalidInput { message: String },

    /// Precondition violation on a state machine.
    #[snafu(display("invalid action: {message}"))]
    InvalidAction { message: String },

    /// Filesystem-level path issue raised before any persistent change.
    #[snafu(display("path error for {path:?}: {message}"))]
    Path { path: PathBuf, message: String },

    /// I/O failure during an append, lock acquisition, or attribute change.
    #[snafu(display("write error: {message}"))]
    Write {
        message: String,
        #[snafu(source(from(io::Error, Some)))]
        source: Option<io::Error>,
    },

    /// I/O failure during a read.
    #[snafu(display("read error: {message}"))]
    Read {
        message: String,
        #[snafu(source(from(io::Error, Some)))]
        source: Option<io::Error>,
    },

    /// A persisted invariant was violated.
    #[snafu(display("corrupt database: {message}"))]
    CorruptDatabase { message: String },

    /// A finder lookup found no matching row.
    #[snafu(display("key not found"))]
    KeyNotFound,

    /// `AddRow`'s timestamp-ordering rule was violated.
    #[snafu(display("key ordering violated: {message}"))]
    KeyOrdering { message: String },

    /// A transaction-boundary query targeted a still-open transaction.
    #[snafu(display("transaction is still active"))]
    TransactionActive,

    /// Operation attempted on a closed or previously-failed handle.
    #[snafu(display("handle is tombstoned"))]
    Tombstoned,
}

pub type Result<T, E = FrozenError> = std::result::Result<T, E>;

impl FrozenError {
    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        FrozenError::InvalidInput {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_action(message: impl Into<String>) -> Self {
        FrozenError::InvalidAction {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        FrozenError::CorruptDatabase {
            message: message.into(),
        }
    }

    pub(crate) fn key_ordering(message: impl Into<String>) -> Self {
        FrozenError::KeyOrdering {
            message: message.into(),
        }
    }

    pub(crate) fn path(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        FrozenError::Path {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn write(message: impl Into<String>, source: io::Error) -> Self {
        FrozenError::Write {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn write_no_source(message: impl Into<String>) -> Self {
        FrozenError::Write {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn read(message: impl Into<String>, source: io::Error) -> Self {
        FrozenError::Read {
            message: message.into(),
            source: Some(source),
        }
    }
}
