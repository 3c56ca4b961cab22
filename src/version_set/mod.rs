//! The version set — mutable coordinator over immutable versions.
//!
//! A [`VersionSet`] owns the one mutable cell in the crate: the pointer to
//! the current [`Version`].  Everything else is either immutable (published
//! versions) or append-only (the manifest), which is what lets the commit
//! protocol give ACID-like guarantees without a transaction manager.
//!
//! # Commit protocol
//!
//! Each [`log_and_apply`](VersionSet::log_and_apply) call is one transition
//! attempt:
//!
//! 1. Take the commit lock.  At most one transition is in flight at a
//!    time; concurrent callers queue here.  This total order is what makes
//!    the manifest a faithful replay source — record order in the log is
//!    exactly the order in which `current` changes.
//! 2. Stamp unset counter fields into the edit and compute the successor
//!    version with the pure [`Version::apply_edit`].  Nothing is visible
//!    yet; an invariant failure aborts with no side effects.
//! 3. Append the edit to the manifest and sync.  An I/O failure here
//!    aborts the attempt: `current` and every counter are untouched, so a
//!    retried edit leaks no file-number gaps into recovery.
//! 4. Publish: swap the current-version pointer.  The swap is a single
//!    atomic pointer replace — readers observe the old layout or the new
//!    one in full, never a mixture — and readers never block on it.
//! 5. If the segment has outgrown its threshold, rotate to a fresh
//!    self-contained segment.  Rotation failure after a durable commit is
//!    only logged; the commit stands.
//!
//! # Readers
//!
//! [`current`](VersionSet::current) is a lock-free load returning an
//! `Arc<Version>`.  Holding that `Arc` pins the layout: the files it names
//! stay protected from cleanup because
//! [`live_file_ids`](VersionSet::live_file_ids) reports them until the
//! last holder drops.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::comparator::{BytewiseComparator, KeyComparator};
use crate::edit::{FileMetadata, VersionEdit};
use crate::manifest::{BaseState, ManifestError, ManifestLog, ManifestRecord};
use crate::storage::{DiskStorage, Storage};
use crate::version::{Version, VersionError};

/// Segment number used when bootstrapping a fresh database directory.
const INITIAL_SEGMENT: u64 = 1;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`VersionSet`].
///
/// All fields have sensible defaults via [`VersionSetConfig::default()`];
/// the configuration is validated by [`VersionSet::open`].
#[derive(Debug, Clone)]
pub struct VersionSetConfig {
    /// Segment size, in bytes, past which the manifest is rotated after a
    /// commit.  Affects recovery latency only, never correctness.
    ///
    /// Default: 4 MiB. Must be ≥ 4096.
    pub manifest_rotation_threshold: u64,

    /// Key ordering for every version of this database.  Must match the
    /// ordering the database was created with.
    ///
    /// Default: [`BytewiseComparator`].
    pub comparator: Arc<dyn KeyComparator>,
}

impl Default for VersionSetConfig {
    fn default() -> Self {
        Self {
            manifest_rotation_threshold: 4 * 1024 * 1024,
            comparator: Arc::new(BytewiseComparator),
        }
    }
}

impl VersionSetConfig {
    fn validate(&self) -> Result<(), VersionSetError> {
        if self.manifest_rotation_threshold < 4096 {
            return Err(VersionSetError::InvalidConfig(
                "manifest_rotation_threshold must be >= 4096".into(),
            ));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`VersionSet`] operations.
#[derive(Debug, Error)]
pub enum VersionSetError {
    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Manifest append or recovery failure.
    #[error("{0}")]
    Manifest(#[from] ManifestError),

    /// Internal-consistency fault while applying an edit.
    #[error("{0}")]
    Version(#[from] VersionError),

    /// The directory was created under a different key ordering.
    #[error("comparator mismatch: database uses {stored:?}, caller supplied {supplied:?}")]
    ComparatorMismatch {
        /// Name persisted in the manifest.
        stored: String,
        /// Name of the comparator passed at open.
        supplied: String,
    },
}

// ------------------------------------------------------------------------------------------------
// Version set core
// ------------------------------------------------------------------------------------------------

/// Tracks the current file-set layout and durably records every change.
///
/// # Thread safety
///
/// `VersionSet` is `Send + Sync`.  Commits from any number of threads
/// serialize on an internal lock; reads never block.
#[derive(Debug)]
pub struct VersionSet {
    dir: PathBuf,
    storage: Arc<dyn Storage>,
    config: VersionSetConfig,

    /// The published layout.  Swapped wholesale on commit.
    current: ArcSwap<Version>,

    /// Monotonic watermarks.  Advanced only after a durable append, and
    /// restored on recovery as the max over all replayed records.
    next_file_number: AtomicU64,
    last_sequence: AtomicU64,
    log_number: AtomicU64,

    /// Active manifest writer.  Doubles as the commit lock: holding it is
    /// what makes a transition the only one in flight.
    manifest: Mutex<ManifestLog>,

    /// Every version that may still have holders, newest last.  Pruned as
    /// entries die; consulted for safe file deletion.
    live: Mutex<Vec<Weak<Version>>>,
}

impl VersionSet {
    /// Opens (or creates) the version set in `dir`, recovering any
    /// previously committed state.
    ///
    /// On a fresh directory the initial manifest segment and `CURRENT`
    /// pointer are created.  On an existing directory the active segment
    /// is replayed; recovery failure is fatal to open, since ignoring
    /// mid-log corruption would silently drop file-set history.
    pub fn open(dir: impl AsRef<Path>, config: VersionSetConfig) -> Result<Self, VersionSetError> {
        Self::open_with_storage(dir, Arc::new(DiskStorage), config)
    }

    /// [`open`](Self::open) with a caller-supplied storage backend.
    pub fn open_with_storage(
        dir: impl AsRef<Path>,
        storage: Arc<dyn Storage>,
        config: VersionSetConfig,
    ) -> Result<Self, VersionSetError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        storage.create_dir_all(&dir)?;

        match ManifestLog::read_current(&dir, storage.as_ref())? {
            None => Self::bootstrap(dir, storage, config),
            Some(_) => Self::recover(dir, storage, config),
        }
    }

    /// Initialize a fresh database directory.
    fn bootstrap(
        dir: PathBuf,
        storage: Arc<dyn Storage>,
        config: VersionSetConfig,
    ) -> Result<Self, VersionSetError> {
        let version = Arc::new(Version::empty(Arc::clone(&config.comparator)));
        let next_file_number = INITIAL_SEGMENT + 1;

        let base = BaseState::capture(&version, 0, next_file_number, 0);
        let mut log = ManifestLog::create(&dir, Arc::clone(&storage), INITIAL_SEGMENT)?;
        log.append_record(&ManifestRecord::Base(base))?;
        // The pointer swap is the commit point of the bootstrap: a crash
        // before it leaves a directory that bootstraps again from scratch.
        ManifestLog::publish_current(&dir, storage.as_ref(), INITIAL_SEGMENT)?;

        info!(dir = %dir.display(), "initialized fresh version set");

        Ok(Self {
            dir,
            storage,
            config,
            current: ArcSwap::from(Arc::clone(&version)),
            next_file_number: AtomicU64::new(next_file_number),
            last_sequence: AtomicU64::new(0),
            log_number: AtomicU64::new(0),
            manifest: Mutex::new(log),
            live: Mutex::new(vec![Arc::downgrade(&version)]),
        })
    }

    /// Rebuild state from the active manifest segment.
    fn recover(
        dir: PathBuf,
        storage: Arc<dyn Storage>,
        config: VersionSetConfig,
    ) -> Result<Self, VersionSetError> {
        let recovered = ManifestLog::recover(&dir, storage.as_ref())?;

        if recovered.base.comparator_name != config.comparator.name() {
            return Err(VersionSetError::ComparatorMismatch {
                stored: recovered.base.comparator_name.clone(),
                supplied: config.comparator.name().to_string(),
            });
        }

        // Fold the base, then every edit, in log order.  apply_edit
        // re-validates level invariants at each step, so a log that
        // replays is known-consistent.
        let empty = Version::empty(Arc::clone(&config.comparator));
        let mut version = empty.apply_edit(&recovered.base.to_edit())?;

        let mut next_file_number = recovered.base.next_file_number;
        let mut last_sequence = recovered.base.last_sequence;
        let mut log_number = recovered.base.log_number;
        for (_, file) in &recovered.base.files {
            next_file_number = next_file_number.max(file.id + 1);
        }

        for edit in &recovered.edits {
            version = version.apply_edit(edit)?;
            if let Some(num) = edit.next_file_number {
                next_file_number = next_file_number.max(num);
            }
            if let Some(seq) = edit.last_sequence {
                last_sequence = last_sequence.max(seq);
            }
            if let Some(num) = edit.log_number {
                log_number = log_number.max(num);
                next_file_number = next_file_number.max(num + 1);
            }
            for (_, file) in &edit.added_files {
                next_file_number = next_file_number.max(file.id + 1);
            }
        }
        next_file_number = next_file_number.max(recovered.segment_number + 1);

        let version = Arc::new(version);

        // Reuse the segment only if it ended cleanly and still has room;
        // otherwise start a fresh one so appends never land after an
        // ignored torn tail.
        let reuse = recovered.clean_tail
            && recovered.segment_size < config.manifest_rotation_threshold;
        let log = if reuse {
            ManifestLog::reopen(&dir, Arc::clone(&storage), recovered.segment_number)?
        } else {
            let new_number = next_file_number;
            next_file_number += 1;
            let base = BaseState::capture(&version, log_number, next_file_number, last_sequence);
            let mut log = ManifestLog::create(&dir, Arc::clone(&storage), new_number)?;
            log.append_record(&ManifestRecord::Base(base))?;
            ManifestLog::publish_current(&dir, storage.as_ref(), new_number)?;
            ManifestLog::remove_segment(&dir, storage.as_ref(), recovered.segment_number);
            log
        };

        info!(
            dir = %dir.display(),
            files = version.total_files(),
            edits = recovered.edits.len(),
            next_file_number,
            last_sequence,
            reused_segment = reuse,
            "version set recovered"
        );

        Ok(Self {
            dir,
            storage,
            config,
            current: ArcSwap::from(Arc::clone(&version)),
            next_file_number: AtomicU64::new(next_file_number),
            last_sequence: AtomicU64::new(last_sequence),
            log_number: AtomicU64::new(log_number),
            manifest: Mutex::new(log),
            live: Mutex::new(vec![Arc::downgrade(&version)]),
        })
    }

    // --------------------------------------------------------------------
    // Commit
    // --------------------------------------------------------------------

    /// Durably records `edit` and publishes the successor version.
    ///
    /// Blocks while another transition is in flight.  On error nothing is
    /// published and no counter moves — the previous, fully committed
    /// layout remains current and the caller may retry.
    pub fn log_and_apply(&self, mut edit: VersionEdit) -> Result<(), VersionSetError> {
        // Commit section: exclusive until the publish (and any rotation)
        // completes.
        let mut manifest = self.manifest.lock();

        if edit.log_number.is_none() {
            edit.set_log_number(self.log_number.load(Ordering::SeqCst));
        }
        if edit.next_file_number.is_none() {
            edit.set_next_file_number(self.next_file_number.load(Ordering::SeqCst));
        }
        if edit.last_sequence.is_none() {
            edit.set_last_sequence(self.last_sequence.load(Ordering::SeqCst));
        }

        let current = self.current.load_full();
        let candidate = current.apply_edit(&edit)?;

        let new_log_number = edit.log_number;
        let new_next_file = edit.next_file_number;
        let new_last_sequence = edit.last_sequence;
        let added = edit.added_files.len();
        let deleted = edit.deleted_files.len();

        // Durability step.  Failure aborts the attempt with no visible
        // effect; success is the commit point.
        manifest.append_record(&ManifestRecord::Edit(edit))?;

        // Publish step: a single pointer swap.
        let candidate = Arc::new(candidate);
        self.install(&candidate);

        if let Some(num) = new_log_number {
            self.log_number.fetch_max(num, Ordering::SeqCst);
        }
        if let Some(num) = new_next_file {
            self.next_file_number.fetch_max(num, Ordering::SeqCst);
        }
        if let Some(seq) = new_last_sequence {
            self.last_sequence.fetch_max(seq, Ordering::SeqCst);
        }

        debug!(
            added,
            deleted,
            files = candidate.total_files(),
            "committed version transition"
        );

        if manifest.written() > self.config.manifest_rotation_threshold {
            if let Err(e) = self.rotate(&mut manifest, &candidate) {
                // The commit is already durable; a failed rotation only
                // postpones the next attempt.
                warn!("manifest rotation failed: {e}");
            }
        }

        Ok(())
    }

    /// Register a version as live and make it current.
    fn install(&self, version: &Arc<Version>) {
        let mut live = self.live.lock();
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(version));
        drop(live);

        self.current.store(Arc::clone(version));
    }

    /// Switch to a fresh segment seeded with `version` as its base state.
    fn rotate(
        &self,
        manifest: &mut ManifestLog,
        version: &Arc<Version>,
    ) -> Result<(), VersionSetError> {
        let new_number = self.new_file_number();
        let base = BaseState::capture(
            version,
            self.log_number.load(Ordering::SeqCst),
            self.next_file_number.load(Ordering::SeqCst),
            self.last_sequence.load(Ordering::SeqCst),
        );

        let mut new_log = ManifestLog::create(&self.dir, Arc::clone(&self.storage), new_number)?;
        new_log.append_record(&ManifestRecord::Base(base))?;
        ManifestLog::publish_current(&self.dir, self.storage.as_ref(), new_number)?;

        let old = std::mem::replace(manifest, new_log);
        ManifestLog::remove_segment(&self.dir, self.storage.as_ref(), old.segment_number());

        info!(
            old_segment = old.segment_number(),
            new_segment = new_number,
            "rotated manifest"
        );
        Ok(())
    }

    // --------------------------------------------------------------------
    // Read accessors
    // --------------------------------------------------------------------

    /// The current layout.  Lock-free; the returned `Arc` pins the layout
    /// and every file it names for as long as it is held.
    pub fn current(&self) -> Arc<Version> {
        self.current.load_full()
    }

    /// Files at `level` in the current layout whose range intersects
    /// `[smallest, largest]`.
    pub fn overlapping_files(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
    ) -> Vec<Arc<FileMetadata>> {
        self.current().overlapping_files(level, smallest, largest)
    }

    /// Last-compacted key recorded for `level`, if any.
    pub fn compaction_pointer(&self, level: usize) -> Option<Vec<u8>> {
        self.current().compaction_pointer(level).map(<[u8]>::to_vec)
    }

    /// Number of files at `level` in the current layout.
    pub fn num_files_at_level(&self, level: usize) -> usize {
        self.current().num_files(level)
    }

    /// Total file count in the current layout.
    pub fn total_files(&self) -> usize {
        self.current().total_files()
    }

    /// Human-readable per-level summary of the current layout.
    pub fn summary(&self) -> String {
        self.current().summary()
    }

    /// Union of file ids referenced by any version that may still have a
    /// holder.  Cleanup may delete a data file only if its id is absent
    /// here — a reader iterating an old layout still depends on it.
    pub fn live_file_ids(&self) -> BTreeSet<u64> {
        let mut live = self.live.lock();
        live.retain(|weak| weak.strong_count() > 0);

        let mut ids = BTreeSet::new();
        for weak in live.iter() {
            if let Some(version) = weak.upgrade() {
                ids.extend(version.file_ids());
            }
        }
        ids
    }

    /// Number of the active manifest segment.
    pub fn manifest_segment_number(&self) -> u64 {
        self.manifest.lock().segment_number()
    }

    // --------------------------------------------------------------------
    // Counters
    // --------------------------------------------------------------------

    /// Allocates and returns a fresh file number.
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// Next file number that would be allocated.
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.load(Ordering::SeqCst)
    }

    /// Advances the allocator past an externally observed file number.
    pub fn mark_file_number_used(&self, num: u64) {
        self.next_file_number.fetch_max(num + 1, Ordering::SeqCst);
    }

    /// Highest sequence number handed out so far.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// Advances the sequence watermark.  Never moves backwards.
    pub fn set_last_sequence(&self, seq: u64) {
        self.last_sequence.fetch_max(seq, Ordering::SeqCst);
    }

    /// WAL segment number of the most recent commit.
    pub fn log_number(&self) -> u64 {
        self.log_number.load(Ordering::SeqCst)
    }
}
