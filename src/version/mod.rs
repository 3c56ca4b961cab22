//! Immutable file-set layouts.
//!
//! A [`Version`] is one point-in-time layout of the database's data files:
//! which files exist, which level each belongs to, and the per-level
//! compaction pointers.  Versions are **immutable** — applying an edit
//! produces a new value and never mutates the receiver — and **shared**
//! via `Arc`, so readers pin a layout with a reference-count increment and
//! never synchronize with writers.
//!
//! # Level invariants
//!
//! - Level 0 files may overlap; they are kept newest-first (descending
//!   file id) since recency decides read precedence there.
//! - Levels ≥ 1 are sorted ascending by smallest key and their key ranges
//!   are pairwise disjoint, which is what makes point and range lookups a
//!   binary search.
//!
//! [`Version::apply_edit`] re-validates the disjointness invariant on every
//! touched level and fails loudly on violation — a violated invariant can
//! only come from a bug in the caller (a compaction emitting overlapping
//! outputs), never from user data, and silently repairing it would corrupt
//! reads forever after.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::NUM_LEVELS;
use crate::comparator::KeyComparator;
use crate::edit::{FileMetadata, VersionEdit};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Internal-consistency faults surfaced while applying an edit.
///
/// None of these are reachable through legitimate edits; surfacing one
/// means the caller (flush or compaction bookkeeping) has a bug.  Policy is
/// to fail the transition loudly and leave the current version untouched.
#[derive(Debug, Error)]
pub enum VersionError {
    /// An edit deleted a file that is not present at the named level.
    #[error("delete of missing file {id} at level {level}")]
    MissingFile {
        /// Level named by the deletion.
        level: usize,
        /// File id named by the deletion.
        id: u64,
    },

    /// An edit added a file id that already exists at the named level.
    #[error("file {id} added twice at level {level}")]
    DuplicateFile {
        /// Level named by the addition.
        level: usize,
        /// File id named by the addition.
        id: u64,
    },

    /// A file's smallest key sorts after its largest key.
    #[error("file {id} at level {level} has an inverted key range")]
    InvertedKeyRange {
        /// Level holding the file.
        level: usize,
        /// Offending file id.
        id: u64,
    },

    /// Two files at a level ≥ 1 have intersecting key ranges.
    #[error("overlapping key ranges at level {level}: files {left} and {right}")]
    OverlappingRanges {
        /// Level holding the files.
        level: usize,
        /// File whose range ends at or past `right`'s start.
        left: u64,
        /// File whose range starts at or before `left`'s end.
        right: u64,
    },

    /// An edit referenced a level outside `0..NUM_LEVELS`.
    #[error("level {level} out of range (levels: {NUM_LEVELS})")]
    LevelOutOfRange {
        /// Offending level index.
        level: usize,
    },
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable file-set layout.
///
/// Obtained from [`VersionSet::current`](crate::version_set::VersionSet::current)
/// and held by readers for the duration of any operation that names files,
/// so the files cannot be deleted from disk underneath them.
#[derive(Debug)]
pub struct Version {
    /// File descriptors per level.  Level 0 newest-first; levels ≥ 1
    /// sorted ascending by smallest key, pairwise disjoint.
    files: [Vec<Arc<FileMetadata>>; NUM_LEVELS],

    /// Last-compacted key per level, advisory only.
    compaction_pointers: [Option<Vec<u8>>; NUM_LEVELS],

    /// Key ordering shared by every version of one database.
    comparator: Arc<dyn KeyComparator>,
}

impl Version {
    /// Creates a layout with no files.
    pub fn empty(comparator: Arc<dyn KeyComparator>) -> Self {
        Self {
            files: Default::default(),
            compaction_pointers: Default::default(),
            comparator,
        }
    }

    /// The comparator this version sorts by.
    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    /// File descriptors at `level`, in level order.
    pub fn files(&self, level: usize) -> &[Arc<FileMetadata>] {
        self.files.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of files at `level`.
    pub fn num_files(&self, level: usize) -> usize {
        self.files(level).len()
    }

    /// Total number of files across all levels.
    pub fn total_files(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// Sum of file sizes at `level`, in bytes.
    pub fn level_size(&self, level: usize) -> u64 {
        self.files(level).iter().map(|f| f.size).sum()
    }

    /// Last-compacted key recorded for `level`, if any.
    pub fn compaction_pointer(&self, level: usize) -> Option<&[u8]> {
        self.compaction_pointers
            .get(level)
            .and_then(|p| p.as_deref())
    }

    /// Every file id referenced by this layout.
    pub fn file_ids(&self) -> BTreeSet<u64> {
        self.files
            .iter()
            .flat_map(|level| level.iter().map(|f| f.id))
            .collect()
    }

    /// Files at `level` whose key range intersects `[smallest, largest]`.
    ///
    /// Level 0 scans every file, since ranges there may overlap arbitrarily.
    /// Levels ≥ 1 binary-search the sorted run for the first candidate and
    /// walk forward while ranges still intersect, so cost is O(log n) plus
    /// the size of the answer.
    pub fn overlapping_files(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
    ) -> Vec<Arc<FileMetadata>> {
        let Some(files) = self.files.get(level) else {
            return Vec::new();
        };

        if level == 0 {
            return files
                .iter()
                .filter(|f| f.overlaps(self.comparator.as_ref(), smallest, largest))
                .cloned()
                .collect();
        }

        // First file whose range can reach `smallest`.
        let start = files
            .partition_point(|f| self.comparator.compare(&f.largest, smallest) == Ordering::Less);

        files[start..]
            .iter()
            .take_while(|f| self.comparator.compare(&f.smallest, largest) != Ordering::Greater)
            .cloned()
            .collect()
    }

    /// Applies `edit` to this layout and returns the successor.
    ///
    /// Pure: the receiver is never mutated, and on error no partial state
    /// escapes.  Deletions are processed before additions so an edit may
    /// replace a file in place.
    pub fn apply_edit(&self, edit: &VersionEdit) -> Result<Version, VersionError> {
        let mut files = self.files.clone();
        let mut pointers = self.compaction_pointers.clone();
        let mut touched = [false; NUM_LEVELS];

        for &(level, id) in &edit.deleted_files {
            let list = files
                .get_mut(level)
                .ok_or(VersionError::LevelOutOfRange { level })?;
            match list.iter().position(|f| f.id == id) {
                Some(idx) => {
                    list.remove(idx);
                }
                None => return Err(VersionError::MissingFile { level, id }),
            }
        }

        for (level, file) in &edit.added_files {
            let level = *level;
            let list = files
                .get_mut(level)
                .ok_or(VersionError::LevelOutOfRange { level })?;
            if self.comparator.compare(&file.smallest, &file.largest) == Ordering::Greater {
                return Err(VersionError::InvertedKeyRange { level, id: file.id });
            }
            if list.iter().any(|f| f.id == file.id) {
                return Err(VersionError::DuplicateFile { level, id: file.id });
            }
            list.push(Arc::new(file.clone()));
            touched[level] = true;
        }

        for (level, &touched) in touched.iter().enumerate() {
            if !touched {
                continue;
            }
            if level == 0 {
                files[0].sort_by(|a, b| b.id.cmp(&a.id));
            } else {
                files[level]
                    .sort_by(|a, b| self.comparator.compare(&a.smallest, &b.smallest));
                self.check_disjoint(level, &files[level])?;
            }
        }

        for (level, key) in &edit.compaction_pointers {
            let slot = pointers
                .get_mut(*level)
                .ok_or(VersionError::LevelOutOfRange { level: *level })?;
            *slot = Some(key.clone());
        }

        Ok(Version {
            files,
            compaction_pointers: pointers,
            comparator: Arc::clone(&self.comparator),
        })
    }

    /// Verify pairwise disjointness of a sorted level ≥ 1 run.
    fn check_disjoint(
        &self,
        level: usize,
        files: &[Arc<FileMetadata>],
    ) -> Result<(), VersionError> {
        for pair in files.windows(2) {
            // Ranges are inclusive, so touching endpoints already overlap.
            if self.comparator.compare(&pair[0].largest, &pair[1].smallest) != Ordering::Less {
                return Err(VersionError::OverlappingRanges {
                    level,
                    left: pair[0].id,
                    right: pair[1].id,
                });
            }
        }
        Ok(())
    }

    /// Human-readable per-level file counts and sizes.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for level in 0..NUM_LEVELS {
            let count = self.num_files(level);
            if count > 0 {
                let _ = writeln!(
                    out,
                    "L{}: {} files ({:.2} MB)",
                    level,
                    count,
                    self.level_size(level) as f64 / (1024.0 * 1024.0)
                );
            }
        }
        out
    }
}
