use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::comparator::KeyComparator;
use crate::edit::{FileMetadata, VersionEdit};
use crate::storage::{DiskStorage, SequentialFile, Storage};
use crate::version_set::{VersionSet, VersionSetConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Open a version set on `temp` with default configuration.
pub fn open_set(temp: &TempDir) -> VersionSet {
    VersionSet::open(temp.path(), VersionSetConfig::default()).expect("open failed")
}

/// Descriptor for a file spanning `[smallest, largest]`.
pub fn file(id: u64, smallest: &[u8], largest: &[u8]) -> FileMetadata {
    FileMetadata::new(id, 4096, smallest.to_vec(), largest.to_vec())
}

/// An edit adding one file at `level` with a range derived from `id`,
/// disjoint from every other id's range.
pub fn add_file_edit(level: usize, id: u64) -> VersionEdit {
    let mut edit = VersionEdit::new();
    edit.add_file(
        level,
        file(
            id,
            format!("k{:016}", 2 * id).as_bytes(),
            format!("k{:016}", 2 * id + 1).as_bytes(),
        ),
    );
    edit
}

// ------------------------------------------------------------------------------------------------
// Fault injection
// ------------------------------------------------------------------------------------------------

/// Storage wrapper that fails appends and syncs on demand, for driving
/// the commit protocol's abort path.
#[derive(Debug)]
pub struct FailingStorage {
    inner: DiskStorage,
    fail_writes: Arc<AtomicBool>,
}

impl FailingStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DiskStorage,
            fail_writes: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Toggle failure of every subsequent append and sync, including on
    /// files opened before the toggle.
    pub fn fail_writes(&self, enabled: bool) {
        self.fail_writes.store(enabled, Ordering::SeqCst);
    }
}

struct FailingFile {
    inner: Box<dyn SequentialFile>,
    fail_writes: Arc<AtomicBool>,
}

impl FailingFile {
    fn check(&self) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        Ok(())
    }
}

impl SequentialFile for FailingFile {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.check()?;
        self.inner.append(data)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.check()?;
        self.inner.sync()
    }
}

impl Storage for FailingStorage {
    fn create(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        Ok(Box::new(FailingFile {
            inner: self.inner.create(path)?,
            fail_writes: Arc::clone(&self.fail_writes),
        }))
    }

    fn open_append(&self, path: &Path) -> io::Result<Box<dyn SequentialFile>> {
        Ok(Box::new(FailingFile {
            inner: self.inner.open_append(path)?,
            fail_writes: Arc::clone(&self.fail_writes),
        }))
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        self.inner.size(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.sync_dir(path)
    }
}

// ------------------------------------------------------------------------------------------------
// Alternative ordering
// ------------------------------------------------------------------------------------------------

/// Reversed bytewise ordering, for comparator-mismatch tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseComparator;

impl KeyComparator for ReverseComparator {
    fn name(&self) -> &'static str {
        "test.ReverseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        b.cmp(a)
    }
}
