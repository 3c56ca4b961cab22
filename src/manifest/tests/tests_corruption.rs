//! Manifest corruption-handling tests.
//!
//! The rule under test: damage at the physical end of the segment is a
//! torn append and is tolerated; damage anywhere else is structural
//! corruption and must fail recovery.
//!
//! Coverage:
//! - Truncated final record → recovered from prior records
//! - Checksum flip in the final record → recovered from prior records
//! - Checksum flip in a middle record → `ManifestError::Corrupt`
//! - Header corruption → `ManifestError::Corrupt`
//! - Segment with no base record → `ManifestError::Corrupt`
//! - `CURRENT` naming garbage → `ManifestError::Corrupt`

#[cfg(test)]
mod tests {
    use crate::manifest::tests::helpers::*;
    use crate::manifest::{ManifestError, ManifestLog, ManifestRecord, segment_file_name};
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn segment_path(dir: &Path) -> std::path::PathBuf {
        dir.join(segment_file_name(1))
    }

    fn overwrite_byte(path: &Path, offset: u64, value: u8) {
        let mut f = OpenOptions::new().read(true).write(true).open(path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.write_all(&[value]).unwrap();
        f.sync_all().unwrap();
    }

    fn flip_byte(path: &Path, offset: u64) {
        let data = std::fs::read(path).unwrap();
        overwrite_byte(path, offset, data[offset as usize] ^ 0xFF);
    }

    /// # Scenario
    /// The final record is physically truncated, as a crash mid-append
    /// would leave it.
    ///
    /// # Actions
    /// 1. Write a segment with a base and three edits.
    /// 2. Chop 5 bytes off the end of the file.
    /// 3. Recover.
    ///
    /// # Expected behavior
    /// Recovery succeeds with the first two edits and reports a dirty
    /// tail.
    #[test]
    fn truncated_final_record_is_tolerated() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let edits = vec![add_file_edit(0, 2), add_file_edit(1, 3), add_file_edit(2, 4)];
        write_segment(tmp.path(), 1, &edits);

        let path = segment_path(tmp.path());
        let len = std::fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 5).unwrap();
        f.sync_all().unwrap();

        let recovered = ManifestLog::recover(tmp.path(), disk().as_ref()).unwrap();
        assert_eq!(recovered.edits, edits[..2].to_vec());
        assert!(!recovered.clean_tail);
    }

    /// # Scenario
    /// The final record's payload is flipped in place, so its frame is
    /// complete but its checksum no longer matches.
    ///
    /// # Expected behavior
    /// The final record is dropped; recovery succeeds with a dirty tail.
    #[test]
    fn corrupt_final_record_is_tolerated() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        write_segment(tmp.path(), 1, &[add_file_edit(0, 2), add_file_edit(1, 3)]);

        let path = segment_path(tmp.path());
        let len = std::fs::metadata(&path).unwrap().len();
        flip_byte(&path, len - 6); // inside the final record's payload

        let recovered = ManifestLog::recover(tmp.path(), disk().as_ref()).unwrap();
        assert_eq!(recovered.edits, vec![add_file_edit(0, 2)]);
        assert!(!recovered.clean_tail);
    }

    /// # Scenario
    /// A record in the middle of the segment is flipped while complete
    /// records follow it.
    ///
    /// # Expected behavior
    /// `ManifestError::Corrupt` — skipping it would silently drop
    /// file-set history.
    #[test]
    fn corruption_before_final_record_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        // Track where the first edit's frame starts so the flip lands in
        // its payload, not in the base record.
        let storage = disk();
        let mut log = ManifestLog::create(tmp.path(), Arc::clone(&storage), 1).unwrap();
        log.append_record(&ManifestRecord::Base(empty_base())).unwrap();
        let first_edit_at = log.written();
        log.append_record(&ManifestRecord::Edit(add_file_edit(0, 2))).unwrap();
        log.append_record(&ManifestRecord::Edit(add_file_edit(1, 3))).unwrap();
        ManifestLog::publish_current(tmp.path(), storage.as_ref(), 1).unwrap();
        drop(log);

        flip_byte(&segment_path(tmp.path()), first_edit_at + 6);

        let err = ManifestLog::recover(tmp.path(), storage.as_ref()).unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt(_)));
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn corrupt_header_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        write_segment(tmp.path(), 1, &[add_file_edit(0, 2)]);

        flip_byte(&segment_path(tmp.path()), 2);

        let err = ManifestLog::recover(tmp.path(), disk().as_ref()).unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt(_)));
        assert!(err.to_string().contains("header checksum mismatch"));
    }

    /// # Scenario
    /// The segment's first record is an edit rather than a base state —
    /// the shape a buggy writer or a spliced file would produce.
    #[test]
    fn segment_without_base_record_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let storage = disk();

        let mut log = ManifestLog::create(tmp.path(), Arc::clone(&storage), 1).unwrap();
        log.append_record(&ManifestRecord::Edit(add_file_edit(0, 2))).unwrap();
        ManifestLog::publish_current(tmp.path(), storage.as_ref(), 1).unwrap();
        drop(log);

        let err = ManifestLog::recover(tmp.path(), storage.as_ref()).unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt(_)));
        assert!(err.to_string().contains("base state"));
    }

    /// An empty published segment has records to tolerate but no base to
    /// recover from.
    #[test]
    fn header_only_segment_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let storage = disk();

        let _log = ManifestLog::create(tmp.path(), Arc::clone(&storage), 1).unwrap();
        ManifestLog::publish_current(tmp.path(), storage.as_ref(), 1).unwrap();

        let err = ManifestLog::recover(tmp.path(), storage.as_ref()).unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt(_)));
        assert!(err.to_string().contains("no base-state record"));
    }

    #[test]
    fn garbage_current_is_fatal() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("CURRENT"), "not-a-manifest\n").unwrap();

        let err = ManifestLog::recover(tmp.path(), disk().as_ref()).unwrap_err();
        assert!(matches!(err, ManifestError::Corrupt(_)));
        assert!(err.to_string().contains("invalid segment"));
    }
}
