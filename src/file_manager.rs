//! Single-writer/many-reader file handle with an append pipeline (spec §4.4).

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use fslock::LockFile;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::FrozenError;

struct WriteRequest {
    bytes: Vec<u8>,
    response: Sender<Result<(), FrozenError>>,
}

/// State shared between the `FileManager` and its background writer
/// thread, so the thread can outlive a single method call without borrowing
/// `FileManager` itself.
struct Shared {
    size: AtomicU64,
    tombstoned: AtomicBool,
}

/// Mediates concurrent I/O on one `.fdb` file: many readers draw from a
/// shared read handle; at most one writer drains a channel that a single
/// background thread services.
pub(crate) struct FileManager {
    path: PathBuf,
    read_handle: File,
    shared: Arc<Shared>,
    writer_tx: Mutex<Option<Sender<WriteRequest>>>,
    writer_thread: Mutex<Option<JoinHandle<()>>>,
    // Held for the lifetime of a write-mode manager; dropping it releases
    // the advisory lock.
    _lock: Option<LockFile>,
}

impl FileManager {
    /// Opens for read-only access. Acquires no lock.
    pub(crate) fn open_read_only(path: impl AsRef<Path>) -> Result<Self, FrozenError> {
        let path = path.as_ref().to_path_buf();
        let read_handle = File::open(&path)
            .map_err(|e| FrozenError::read(format!("opening {path:?} for read"), e))?;
        let size = read_handle
            .metadata()
            .map_err(|e| FrozenError::read(format!("statting {path:?}"), e))?
            .len();
        Ok(FileManager {
            path,
            read_handle,
            shared: Arc::new(Shared {
                size: AtomicU64::new(size),
                tombstoned: AtomicBool::new(false),
            }),
            writer_tx: Mutex::new(None),
            writer_thread: Mutex::new(None),
            _lock: None,
        })
    }

    /// Opens for write access, acquiring a non-blocking exclusive advisory
    /// lock. Fails fast (spec: "< 50 ms") if another writer holds it.
    pub(crate) fn open_read_write(path: impl AsRef<Path>) -> Result<Self, FrozenError> {
        let path = path.as_ref().to_path_buf();
        let mut lock =
            LockFile::open(&path).map_err(|e| FrozenError::write("opening advisory lock", e))?;
        let acquired = lock
            .try_lock()
            .map_err(|e| FrozenError::write("acquiring advisory lock", e))?;
        if !acquired {
            return Err(FrozenError::write_no_source(
                "another writer already holds the advisory lock",
            ));
        }

        let read_handle = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| FrozenError::read(format!("opening {path:?} for read"), e))?;
        let size = read_handle
            .metadata()
            .map_err(|e| FrozenError::read(format!("statting {path:?}"), e))?
            .len();

        debug!(path = %path.display(), "acquired write lock");

        Ok(FileManager {
            path,
            read_handle,
            shared: Arc::new(Shared {
                size: AtomicU64::new(size),
                tombstoned: AtomicBool::new(false),
            }),
            writer_tx: Mutex::new(None),
            writer_thread: Mutex::new(None),
            _lock: Some(lock),
        })
    }

    /// Reads `len` bytes at `offset`. Safe from any thread.
    pub(crate) fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, FrozenError> {
        let mut buf = vec![0u8; len];
        self.read_handle
            .read_exact_at(&mut buf, offset)
            .map_err(|e| FrozenError::read(format!("reading {len} bytes at {offset}"), e))?;
        Ok(buf)
    }

    /// The last published end-of-file position.
    pub(crate) fn size(&self) -> u64 {
        self.shared.size.load(Ordering::Acquire)
    }

    /// Attaches exactly one append-only writer. A second attempt — while
    /// the first is still attached — fails with `InvalidActionError`; once
    /// that writer calls [`WriterHandle::detach`] (at Commit, Rollback, or
    /// an aborted transaction's close) a new one may attach.
    pub(crate) fn set_writer(&self) -> Result<WriterHandle<'_>, FrozenError> {
        if self.shared.tombstoned.load(Ordering::Acquire) {
            return Err(FrozenError::Tombstoned);
        }

        let mut writer_tx = self.writer_tx.lock();
        if writer_tx.is_some() {
            return Err(FrozenError::invalid_action(
                "a writer is already attached to this file manager",
            ));
        }

        let append_handle = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| FrozenError::write(format!("opening {:?} for append", self.path), e))?;

        let (tx, rx) = bounded::<WriteRequest>(64);

        let shared = Arc::clone(&self.shared);
        let path = self.path.clone();
        let thread = std::thread::Builder::new()
            .name("frozendb-writer".into())
            .spawn(move || {
                let mut file = append_handle;
                for request in rx {
                    let result = file.write_all(&request.bytes).map_err(|e| {
                        warn!(path = %path.display(), error = %e, "append failed");
                        FrozenError::write("appending to data file", e)
                    });
                    if result.is_ok() {
                        let new_size =
                            shared.size.load(Ordering::Acquire) + request.bytes.len() as u64;
                        shared.size.store(new_size, Ordering::Release);
                        trace!(new_size, "published new file size");
                    }
                    let _ = request.response.send(result);
                }
            })
            .map_err(|e| {
                warn!(path = %self.path.display(), error = %e, "failed to spawn writer thread");
                FrozenError::write("spawning the writer thread", e)
            })?;

        // Only record the writer once the thread actually exists — an
        // earlier spawn failure must leave no writer attached, so a retry
        // isn't permanently blocked by a phantom "already attached" error.
        *writer_tx = Some(tx.clone());
        drop(writer_tx);
        *self.writer_thread.lock() = Some(thread);

        Ok(WriterHandle { manager: self, tx })
    }

    /// Releases the file lock and tombstones the manager.
    pub(crate) fn close(&self) {
        self.shared.tombstoned.store(true, Ordering::Release);
        if let Some(tx) = self.writer_tx.lock().take() {
            drop(tx);
        }
        if let Some(thread) = self.writer_thread.lock().take() {
            let _ = thread.join();
        }
        debug!(path = %self.path.display(), "file manager closed");
    }

    pub(crate) fn is_tombstoned(&self) -> bool {
        self.shared.tombstoned.load(Ordering::Acquire)
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        self.close();
    }
}

/// The single attached writer. Writes are synchronous from the submitter's
/// viewpoint: submit, await response, proceed.
pub(crate) struct WriterHandle<'a> {
    manager: &'a FileManager,
    tx: Sender<WriteRequest>,
}

impl<'a> WriterHandle<'a> {
    pub(crate) fn append(&self, bytes: Vec<u8>) -> Result<(), FrozenError> {
        if self.manager.is_tombstoned() {
            return Err(FrozenError::Tombstoned);
        }
        let (response_tx, response_rx) = bounded(1);
        self.tx
            .send(WriteRequest {
                bytes,
                response: response_tx,
            })
            .map_err(|_| FrozenError::Tombstoned)?;
        response_rx.recv().map_err(|_| FrozenError::Tombstoned)?
    }

    pub(crate) fn size(&self) -> u64 {
        self.manager.size()
    }

    /// Releases this writer so a later transaction in the same session can
    /// attach its own. Called at Commit, Rollback, or when a transaction is
    /// abandoned without either — never tombstones the manager itself.
    pub(crate) fn detach(self) {
        drop(self.tx);
        if let Some(sender) = self.manager.writer_tx.lock().take() {
            drop(sender);
        }
        if let Some(thread) = self.manager.writer_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        std::fs::write(&path, b"0123456789").unwrap();

        let manager = FileManager::open_read_write(&path).unwrap();
        assert_eq!(manager.size(), 10);
        let bytes = manager.read(2, 4).unwrap();
        assert_eq!(bytes, b"2345");
    }

    #[test]
    fn second_writer_attach_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        std::fs::write(&path, b"").unwrap();
        let manager = FileManager::open_read_write(&path).unwrap();
        let _writer = manager.set_writer().unwrap();
        assert!(manager.set_writer().is_err());
    }

    #[test]
    fn append_publishes_size_and_is_visible_to_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        std::fs::write(&path, b"").unwrap();
        let manager = FileManager::open_read_write(&path).unwrap();
        let writer = manager.set_writer().unwrap();
        writer.append(b"hello".to_vec()).unwrap();
        assert_eq!(manager.size(), 5);
        assert_eq!(manager.read(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn close_tombstones_future_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        std::fs::write(&path, b"").unwrap();
        let manager = FileManager::open_read_write(&path).unwrap();
        let writer = manager.set_writer().unwrap();
        manager.close();
        assert!(writer.append(b"x".to_vec()).is_err());
    }

    #[test]
    fn writer_can_reattach_after_detach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        std::fs::write(&path, b"").unwrap();
        let manager = FileManager::open_read_write(&path).unwrap();

        let writer = manager.set_writer().unwrap();
        writer.append(b"hello".to_vec()).unwrap();
        writer.detach();

        let writer = manager.set_writer().unwrap();
        writer.append(b"world".to_vec()).unwrap();
        assert_eq!(manager.size(), 10);
        assert_eq!(manager.read(0, 10).unwrap(), b"helloworld");
    }

    #[test]
    fn second_writer_cannot_lock_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.fdb");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"data").unwrap();
        let _first = FileManager::open_read_write(&path).unwrap();
        assert!(FileManager::open_read_write(&path).is_err());
    }
}
