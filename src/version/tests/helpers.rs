use std::sync::Arc;

use crate::comparator::BytewiseComparator;
use crate::edit::{FileMetadata, VersionEdit};
use crate::version::Version;

/// An empty version over the bytewise ordering.
pub fn empty_version() -> Version {
    Version::empty(Arc::new(BytewiseComparator))
}

/// Descriptor for a file spanning `[smallest, largest]`.
pub fn file(id: u64, smallest: &[u8], largest: &[u8]) -> FileMetadata {
    FileMetadata::new(id, 1 << 20, smallest.to_vec(), largest.to_vec())
}

/// Apply a single-addition edit, panicking on failure.
pub fn with_file(version: &Version, level: usize, meta: FileMetadata) -> Version {
    let mut edit = VersionEdit::new();
    edit.add_file(level, meta);
    version.apply_edit(&edit).expect("apply_edit failed")
}
