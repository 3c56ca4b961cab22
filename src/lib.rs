//! # stratadb
//!
//! A crash-consistent **file-set versioning core** for LSM-tree storage
//! engines: it tracks which immutable sorted data files belong to which
//! level, durably records every change in an append-only manifest log
//! *before* the change becomes visible, and publishes each new layout as
//! an immutable, reference-counted [`Version`].
//!
//! The crate deliberately owns only the metadata problem.  Reading and
//! writing key/value data, choosing what to compact, and producing data
//! files are the embedding engine's job; this core records the results and
//! guarantees they survive a crash.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{FileMetadata, VersionEdit, VersionSet, VersionSetConfig};
//!
//! let vs = VersionSet::open("/tmp/my_db", VersionSetConfig::default()).unwrap();
//!
//! // A flush produced a new data file — record it at level 0.
//! let id = vs.new_file_number();
//! let mut edit = VersionEdit::new();
//! edit.add_file(0, FileMetadata::new(id, 4096, b"apple".to_vec(), b"mango".to_vec()));
//! vs.log_and_apply(edit).unwrap();
//!
//! // Readers pin an immutable layout; commits never disturb it.
//! let version = vs.current();
//! for file in version.overlapping_files(0, b"banana", b"kiwi") {
//!     println!("file {} covers the range", file.id);
//! }
//!
//! // After a restart, open() replays the manifest and the layout is back.
//! ```
//!
//! ## Guarantees
//!
//! - **Atomicity** — a transition is either fully published or invisible;
//!   a failed commit leaves the previous layout current.
//! - **Durability** — the manifest append is fsynced before a transition
//!   is published; every published layout survives a crash.
//! - **Total order** — manifest record order equals publication order, so
//!   replay always reconstructs the exact committed state.
//! - **Non-blocking reads** — [`VersionSet::current`] is a lock-free
//!   pointer load; a held [`Version`] is never mutated and the files it
//!   names are reported live until the last holder drops it.

pub mod comparator;
pub mod edit;
pub mod encoding;
pub mod manifest;
pub mod storage;
pub mod version;
pub mod version_set;

pub use comparator::{BytewiseComparator, KeyComparator};
pub use edit::{EditError, FileMetadata, VersionEdit};
pub use manifest::{ManifestError, ManifestLog};
pub use storage::{DiskStorage, SequentialFile, Storage};
pub use version::{Version, VersionError};
pub use version_set::{VersionSet, VersionSetConfig, VersionSetError};

/// Number of levels in the file-set layout.
///
/// Level 0 holds freshly flushed, possibly overlapping files; each higher
/// level holds sorted, non-overlapping files.  Seven levels with a
/// conventional ~10× size fan-out covers petabyte-scale trees, so the
/// count is fixed rather than configurable.
pub const NUM_LEVELS: usize = 7;
