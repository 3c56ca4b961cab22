use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::edit::{FileMetadata, VersionEdit};
use crate::manifest::{BaseState, ManifestLog, ManifestRecord};
use crate::storage::{DiskStorage, Storage};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn disk() -> Arc<dyn Storage> {
    Arc::new(DiskStorage)
}

/// A base state with no files and zeroed counters.
pub fn empty_base() -> BaseState {
    BaseState {
        comparator_name: "stratadb.BytewiseComparator".to_string(),
        log_number: 0,
        next_file_number: 2,
        last_sequence: 0,
        compaction_pointers: Vec::new(),
        files: Vec::new(),
    }
}

/// An edit adding one file at `level`.
pub fn add_file_edit(level: usize, id: u64) -> VersionEdit {
    let mut edit = VersionEdit::new();
    edit.add_file(
        level,
        FileMetadata::new(id, 1024, format!("a{id:04}").into_bytes(), format!("b{id:04}").into_bytes()),
    );
    edit
}

/// Create a published segment holding a base record plus `edits`.
pub fn write_segment(dir: &Path, segment_number: u64, edits: &[VersionEdit]) -> ManifestLog {
    let storage = disk();
    let mut log = ManifestLog::create(dir, Arc::clone(&storage), segment_number).unwrap();
    log.append_record(&ManifestRecord::Base(empty_base())).unwrap();
    for edit in edits {
        log.append_record(&ManifestRecord::Edit(edit.clone())).unwrap();
    }
    ManifestLog::publish_current(dir, storage.as_ref(), segment_number).unwrap();
    log
}
