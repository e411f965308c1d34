//! Path and input validation shared by the Create and Open sequences
//! (spec §4.8 steps 1–2, component C10).

use std::path::Path;

use crate::config::FILE_EXTENSION;
use crate::error::{FrozenError, Result};
use crate::header::Header;

/// Checks the arguments a caller passes to `create`/`open` before any
/// filesystem interaction: non-empty path, correct extension, and that
/// `row_size`/`skew_ms` fall within the ranges `Header::new` enforces.
pub(crate) fn validate_inputs(path: &Path, row_size: u32, skew_ms: u64) -> Result<()> {
    validate_path_shape(path)?;
    // Header::new carries the authoritative range checks; reuse it rather
    // than duplicating MIN_ROW_SIZE/MAX_ROW_SIZE/MAX_SKEW_MS comparisons.
    Header::new(row_size, skew_ms)?;
    Ok(())
}

pub(crate) fn validate_path_shape(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(FrozenError::invalid_input("path must not be empty"));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext == FILE_EXTENSION => Ok(()),
        _ => Err(FrozenError::invalid_input(format!(
            "path must have a .{FILE_EXTENSION} extension"
        ))),
    }
}

/// Validates a path for `create`: the parent directory must exist, be a
/// directory, and be writable; the target itself must not already exist.
/// Paths are taken literally — no tilde expansion, no shell globbing.
pub(crate) fn validate_create_path(path: &Path) -> Result<()> {
    let parent = parent_dir(path)?;
    let meta = std::fs::metadata(parent)
        .map_err(|_| FrozenError::path(parent, "parent directory does not exist"))?;
    if !meta.is_dir() {
        return Err(FrozenError::path(parent, "parent is not a directory"));
    }
    if meta.permissions().readonly() {
        return Err(FrozenError::path(parent, "parent directory is not writable"));
    }
    if path.exists() {
        return Err(FrozenError::path(path, "target already exists"));
    }
    Ok(())
}

/// Validates a path for `open`: it must already exist and be a regular file.
pub(crate) fn validate_open_path(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|_| FrozenError::path(path, "does not exist"))?;
    if !meta.is_file() {
        return Err(FrozenError::path(path, "is not a regular file"));
    }
    Ok(())
}

fn parent_dir(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| FrozenError::invalid_input("path has no parent directory"))
}
