//! Commit-protocol tests: publication, counter stamping, and the abort
//! path under injected I/O failure.
//!
//! Coverage:
//! - Successful commit publishes the successor layout
//! - Apply errors abort before any I/O
//! - Append failure aborts with `current` and counters untouched
//! - Retry after abort succeeds
//! - Pinned readers keep observing their layout
//! - `live_file_ids` tracks outstanding versions, not just `current`

#[cfg(test)]
mod tests {
    use crate::version_set::tests::helpers::*;
    use crate::edit::VersionEdit;
    use crate::version_set::{VersionSet, VersionSetConfig, VersionSetError};
    use crate::version::VersionError;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn commit_publishes_successor() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        assert_eq!(vs.total_files(), 0);
        vs.log_and_apply(add_file_edit(0, vs.new_file_number())).unwrap();

        assert_eq!(vs.total_files(), 1);
        assert_eq!(vs.num_files_at_level(0), 1);
    }

    #[test]
    fn commit_stamps_unset_counters() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        vs.set_last_sequence(777);
        let id = vs.new_file_number();
        vs.log_and_apply(add_file_edit(2, id)).unwrap();

        // The stamped watermarks survive a reopen.
        drop(vs);
        let vs = open_set(&temp);
        assert_eq!(vs.last_sequence(), 777);
        assert!(vs.next_file_number() > id);
    }

    #[test]
    fn sequence_watermark_never_regresses() {
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        vs.set_last_sequence(100);
        vs.set_last_sequence(50);
        assert_eq!(vs.last_sequence(), 100);
    }

    /// # Scenario
    /// An edit deletes a file that does not exist.
    ///
    /// # Expected behavior
    /// The transition aborts before touching the manifest; `current` is
    /// unchanged and a valid commit still works afterwards.
    #[test]
    fn apply_error_aborts_before_io() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        let before = vs.current();
        let mut edit = VersionEdit::new();
        edit.delete_file(3, 99);
        let err = vs.log_and_apply(edit).unwrap_err();
        assert!(matches!(
            err,
            VersionSetError::Version(VersionError::MissingFile { level: 3, id: 99 })
        ));

        assert!(Arc::ptr_eq(&before, &vs.current()));
        vs.log_and_apply(add_file_edit(0, vs.new_file_number())).unwrap();
    }

    /// # Scenario
    /// The manifest append fails mid-commit.
    ///
    /// # Starting environment
    /// A version set over fault-injecting storage, one file committed.
    ///
    /// # Actions
    /// 1. Enable write failure.
    /// 2. Attempt a second commit.
    /// 3. Disable write failure and retry the same edit.
    ///
    /// # Expected behavior
    /// The failed attempt returns an error, leaves `current` pointing at
    /// the same version object, and moves no counter; the retry commits.
    #[test]
    fn append_failure_aborts_cleanly() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let storage = FailingStorage::new();
        let vs = VersionSet::open_with_storage(
            temp.path(),
            Arc::clone(&storage) as Arc<dyn crate::storage::Storage>,
            VersionSetConfig::default(),
        )
        .unwrap();

        let first = vs.new_file_number();
        vs.log_and_apply(add_file_edit(1, first)).unwrap();

        let before = vs.current();
        let next_file_before = vs.next_file_number();
        let log_before = vs.log_number();

        storage.fail_writes(true);
        let id = vs.new_file_number();
        let err = vs.log_and_apply(add_file_edit(1, id)).unwrap_err();
        assert!(matches!(err, VersionSetError::Manifest(_)));

        // Aborted: same version object, no watermark movement.
        assert!(Arc::ptr_eq(&before, &vs.current()));
        assert_eq!(vs.num_files_at_level(1), 1);
        assert_eq!(vs.next_file_number(), next_file_before + 1); // only the explicit allocation
        assert_eq!(vs.log_number(), log_before);

        storage.fail_writes(false);
        vs.log_and_apply(add_file_edit(1, id)).unwrap();
        assert_eq!(vs.num_files_at_level(1), 2);

        // The aborted attempt left nothing behind in the log.
        drop(vs);
        let vs = VersionSet::open_with_storage(
            temp.path(),
            storage as Arc<dyn crate::storage::Storage>,
            VersionSetConfig::default(),
        )
        .unwrap();
        assert_eq!(vs.num_files_at_level(1), 2);
    }

    #[test]
    fn pinned_reader_keeps_its_layout() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        let id1 = vs.new_file_number();
        vs.log_and_apply(add_file_edit(2, id1)).unwrap();
        let pinned = vs.current();

        let id2 = vs.new_file_number();
        let mut edit = VersionEdit::new();
        edit.delete_file(2, id1);
        edit.add_file(2, file(id2, b"a", b"b"));
        vs.log_and_apply(edit).unwrap();

        // The pinned snapshot still shows the replaced file.
        assert_eq!(pinned.files(2)[0].id, id1);
        assert_eq!(vs.current().files(2)[0].id, id2);
    }

    #[test]
    fn live_file_ids_follows_outstanding_versions() {
        init_tracing();
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        let id1 = vs.new_file_number();
        vs.log_and_apply(add_file_edit(2, id1)).unwrap();
        let pinned = vs.current();

        let id2 = vs.new_file_number();
        let mut edit = VersionEdit::new();
        edit.delete_file(2, id1);
        edit.add_file(2, file(id2, b"a", b"b"));
        vs.log_and_apply(edit).unwrap();

        // Both files are live while the old version is pinned.
        let ids = vs.live_file_ids();
        assert!(ids.contains(&id1));
        assert!(ids.contains(&id2));

        // Releasing the pin retires the replaced file.
        drop(pinned);
        let ids = vs.live_file_ids();
        assert!(!ids.contains(&id1));
        assert!(ids.contains(&id2));
    }

    #[test]
    fn compaction_pointer_round_trips_through_commit() {
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        assert_eq!(vs.compaction_pointer(1), None);

        let mut edit = VersionEdit::new();
        edit.set_compaction_pointer(1, b"pivot".to_vec());
        vs.log_and_apply(edit).unwrap();

        assert_eq!(vs.compaction_pointer(1), Some(b"pivot".to_vec()));
    }

    #[test]
    fn file_number_allocation_is_monotonic() {
        let temp = TempDir::new().unwrap();
        let vs = open_set(&temp);

        let a = vs.new_file_number();
        let b = vs.new_file_number();
        assert!(b > a);

        vs.mark_file_number_used(b + 10);
        assert_eq!(vs.next_file_number(), b + 11);

        // Marking an already-allocated number is a no-op.
        vs.mark_file_number_used(a);
        assert_eq!(vs.next_file_number(), b + 11);
    }

    #[test]
    fn rejects_invalid_config() {
        let temp = TempDir::new().unwrap();
        let err = VersionSet::open(
            temp.path(),
            VersionSetConfig {
                manifest_rotation_threshold: 16,
                ..VersionSetConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, VersionSetError::InvalidConfig(_)));
    }
}
