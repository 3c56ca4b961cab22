//! File-system abstraction for the manifest layer.
//!
//! The versioning core touches disk through a deliberately small surface:
//! sequential append with explicit sync, whole-file read, atomic create,
//! atomic rename, and directory sync.  Production code uses
//! [`DiskStorage`]; tests substitute fault-injecting implementations to
//! exercise abort and crash paths without touching a real device.
//!
//! # Durability contract
//!
//! - [`SequentialFile::sync`] must not return until previously appended
//!   bytes are durable (`fsync` semantics, via [`File::sync_all`]).
//! - [`Storage::rename`] must be atomic with respect to crashes: after
//!   recovery the target names either the old file or the complete new
//!   file, never a mixture.
//! - [`Storage::sync_dir`] makes preceding creates/renames in a directory
//!   durable; callers invoke it after every pointer-file swap.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// An append-only file handle.
///
/// Appends are buffered by the OS until [`sync`](SequentialFile::sync) is
/// called; callers that need durability must sync before reporting success.
pub trait SequentialFile: Send {
    /// Append `data` at the current end of the file.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush all appended bytes to stable storage.
    fn sync(&mut self) -> io::Result<()>;
}

/// The file-system operations the versioning core depends on.
///
/// Implementations must be safe to share across threads; the core itself
/// serializes writes to any single file.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Create (or truncate) a file for sequential appending.
    fn create(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>>;

    /// Open an existing file for appending at its current end.
    fn open_append(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>>;

    /// Read the entire contents of a file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Atomically rename `from` to `to`, replacing `to` if it exists.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file.
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Whether a file exists.
    fn exists(&self, path: &Path) -> bool;

    /// Size of a file in bytes.
    fn size(&self, path: &Path) -> io::Result<u64>;

    /// Create a directory and any missing parents.
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Sync a directory so that preceding creates and renames in it are
    /// durable.
    fn sync_dir(&self, path: &Path) -> io::Result<()>;
}

// ------------------------------------------------------------------------------------------------
// Disk implementation
// ------------------------------------------------------------------------------------------------

/// [`Storage`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStorage;

struct DiskFile {
    file: File,
}

impl SequentialFile for DiskFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl Storage for DiskStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Box::new(DiskFile { file }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Box::new(DiskFile { file }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::open(path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        File::open(path)?.sync_all()
    }
}
