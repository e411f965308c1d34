//! The Create and Open bootstrap sequences (spec §4.8, component C8):
//! validation, atomic file creation, initial checksum emission, lock
//! acquisition, integrity verification, and Finder strategy selection.

use std::fs::OpenOptions;
use std::io;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::HEADER_SIZE;
use crate::error::{FrozenError, Result};
use crate::file_manager::FileManager;
use crate::finder::{Finder, InMemoryFinder, SimpleFinder};
use crate::header::Header;
use crate::row::ChecksumRow;
use crate::validate;

/// The three pieces of host-provided context the core consumes at Create
/// time (spec §6 "Environment expectations from the host"). The engine
/// never inspects environment variables or process credentials itself —
/// the embedding host derives these and passes them in.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCapabilities {
    pub may_set_append_only: bool,
    pub original_user_uid: Option<u32>,
    pub original_user_gid: Option<u32>,
}

/// The filesystem append-only attribute, treated as an opaque capability
/// supplied by the host (spec §9 "Append-only attribute"). Implement this
/// against whatever platform mechanism the embedding host has available
/// (e.g. a `chattr +a`-equivalent ioctl); frozenDB only calls it when
/// [`HostCapabilities::may_set_append_only`] is set.
pub trait AppendOnlyAttribute: Send + Sync {
    fn set(&self, path: &Path) -> io::Result<()>;
}

/// The capability is absent: `set` is never called because callers gate it
/// on `may_set_append_only`, but this stands in when a host genuinely has
/// no such mechanism (e.g. during tests).
#[derive(Debug, Default)]
pub struct NoAppendOnlyAttribute;

impl AppendOnlyAttribute for NoAppendOnlyAttribute {
    fn set(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Which [`Finder`] strategy an open session builds. Chosen once, at
/// construction time; not dynamic thereafter (spec §4.6, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinderStrategy {
    /// Builds complete key/transaction maps up front; O(1) lookups, O(file
    /// size) construction and memory.
    InMemory,
    /// Keeps only `max_timestamp` and the row count; lookups scan the file.
    Simple,
}

/// Runs the Create sequence (spec §4.8): validates inputs and the target
/// path, rejects a super-user caller with no original-user identity to
/// `chown` to, then atomically creates the file, header, and initial
/// checksum row. Any failure after the file is created removes it.
pub(crate) fn create(
    path: &Path,
    row_size: u32,
    skew_ms: u64,
    caps: &HostCapabilities,
    attribute: &dyn AppendOnlyAttribute,
) -> Result<()> {
    validate::validate_inputs(path, row_size, skew_ms)?;
    validate::validate_create_path(path)?;

    // A process can only hold the append-only-setting capability as the
    // super-user; with no original-user identity supplied there would be
    // nobody to hand the file back to afterwards (spec §4.8 step 3).
    if caps.may_set_append_only && caps.original_user_uid.is_none() {
        return Err(FrozenError::invalid_action(
            "refusing to create as the super-user with no original-user identity to chown to",
        ));
    }

    let header = Header::new(row_size, skew_ms)?;
    let result = create_inner(path, &header, caps, attribute);
    if result.is_err() {
        let _ = std::fs::remove_file(path);
    }
    result
}

fn create_inner(
    path: &Path,
    header: &Header,
    caps: &HostCapabilities,
    attribute: &dyn AppendOnlyAttribute,
) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)
        .map_err(|e| FrozenError::write(format!("creating {path:?}"), e))?;

    let header_bytes = header.encode();
    file.write_all(&header_bytes)
        .map_err(|e| FrozenError::write("writing header", e))?;
    file.sync_data()
        .map_err(|e| FrozenError::write("flushing header", e))?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes);
    let checksum_row = ChecksumRow {
        crc: hasher.finalize(),
    }
    .marshal(header.row_size as usize)?;
    file.write_all(&checksum_row)
        .map_err(|e| FrozenError::write("writing initial checksum row", e))?;
    file.sync_data()
        .map_err(|e| FrozenError::write("flushing initial checksum row", e))?;

    if let Some(uid) = caps.original_user_uid {
        std::os::unix::fs::chown(path, Some(uid), caps.original_user_gid)
            .map_err(|e| FrozenError::write(format!("chowning {path:?}"), e))?;
    }

    if caps.may_set_append_only {
        attribute
            .set(path)
            .map_err(|e| FrozenError::write("setting append-only attribute", e))?;
    }

    debug!(path = %path.display(), row_size = header.row_size, "created database file");
    Ok(())
}

/// Runs the Open sequence (spec §4.8): validates the path, acquires the
/// file manager (and, for write mode, the advisory lock), then verifies
/// the header and the initial checksum row before handing back both.
pub(crate) fn open(path: &Path, write: bool) -> Result<(Header, FileManager)> {
    validate::validate_path_shape(path)?;
    validate::validate_open_path(path)?;

    let file_manager = if write {
        FileManager::open_read_write(path)?
    } else {
        FileManager::open_read_only(path)?
    };

    let size = file_manager.size();
    if size < HEADER_SIZE as u64 {
        return Err(FrozenError::corrupt("file is smaller than the header"));
    }
    let header_bytes = file_manager.read(0, HEADER_SIZE)?;
    let header = Header::decode(&header_bytes)?;

    if size < HEADER_SIZE as u64 + header.row_size as u64 {
        return Err(FrozenError::corrupt(
            "file has no room for the initial checksum row",
        ));
    }
    let first_row = file_manager.read(HEADER_SIZE as u64, header.row_size as usize)?;
    let checksum_row = ChecksumRow::unmarshal(&first_row)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header_bytes);
    if checksum_row.crc != hasher.finalize() {
        warn!(path = %path.display(), "initial checksum row does not match the header");
        return Err(FrozenError::corrupt(
            "initial checksum row does not match the header",
        ));
    }

    Ok((header, file_manager))
}

/// Builds the Finder a session will use, per the strategy the caller chose
/// at open/create time (spec §4.6, §4.8 step 5).
pub(crate) fn build_finder(
    strategy: FinderStrategy,
    file_manager: &Arc<FileManager>,
    header: &Header,
) -> Result<Finder> {
    match strategy {
        FinderStrategy::InMemory => Ok(Finder::InMemory(InMemoryFinder::build(
            file_manager,
            header.row_size as u64,
        )?)),
        FinderStrategy::Simple => Ok(Finder::Simple(SimpleFinder::build(
            Arc::clone(file_manager),
            header.row_size as u64,
            header.skew_ms,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> HostCapabilities {
        HostCapabilities {
            may_set_append_only: false,
            original_user_uid: None,
            original_user_gid: None,
        }
    }

    #[test]
    fn e1_create_produces_header_plus_initial_checksum_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        create(&path, 512, 5000, &caps(), &NoAppendOnlyAttribute).unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        assert_eq!(size, 64 + 512);

        let (header, file_manager) = open(&path, false).unwrap();
        assert_eq!(header.row_size, 512);
        assert_eq!(header.skew_ms, 5000);

        let header_bytes = file_manager.read(0, HEADER_SIZE).unwrap();
        let row_bytes = file_manager.read(HEADER_SIZE as u64, 512).unwrap();
        let row = ChecksumRow::unmarshal(&row_bytes).unwrap();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        assert_eq!(row.crc, hasher.finalize());
    }

    #[test]
    fn create_rejects_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        create(&path, 512, 0, &caps(), &NoAppendOnlyAttribute).unwrap();
        assert!(create(&path, 512, 0, &caps(), &NoAppendOnlyAttribute).is_err());
    }

    #[test]
    fn create_cleans_up_on_failed_input_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        assert!(create(&path, 4, 0, &caps(), &NoAppendOnlyAttribute).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn super_user_without_original_identity_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        let caps = HostCapabilities {
            may_set_append_only: true,
            original_user_uid: None,
            original_user_gid: None,
        };
        assert!(matches!(
            create(&path, 512, 0, &caps, &NoAppendOnlyAttribute),
            Err(FrozenError::InvalidAction { .. })
        ));
        assert!(!path.exists());
    }

    #[test]
    fn open_detects_tampered_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        create(&path, 512, 0, &caps(), &NoAppendOnlyAttribute).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[70] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            open(&path, false),
            Err(FrozenError::CorruptDatabase { .. })
        ));
    }

    #[test]
    fn build_finder_selects_requested_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        create(&path, 512, 0, &caps(), &NoAppendOnlyAttribute).unwrap();
        let (header, file_manager) = open(&path, false).unwrap();
        let file_manager = Arc::new(file_manager);

        assert!(matches!(
            build_finder(FinderStrategy::InMemory, &file_manager, &header).unwrap(),
            Finder::InMemory(_)
        ));
        assert!(matches!(
            build_finder(FinderStrategy::Simple, &file_manager, &header).unwrap(),
            Finder::Simple(_)
        ));
    }
}
