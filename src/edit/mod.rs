//! Version edits — serializable diffs between two file-set layouts.
//!
//! A [`VersionEdit`] is the unit of change in the versioning core: it lists
//! files to add, files to remove, advisory compaction pointers, and optional
//! overrides of the global counters.  Edits are pure diffs — they carry no
//! reference to any version and can be encoded independently, which is what
//! makes the manifest log a faithful replay source.
//!
//! # Wire format
//!
//! An edit is a sequence of tagged fields, each present only if set:
//!
//! ```text
//! [u32 tag][field payload] [u32 tag][field payload] …
//! ```
//!
//! Unknown tags are rejected rather than skipped: the manifest is not a
//! negotiation surface, and a tag this build does not understand means the
//! log was written by an incompatible build.  New optional fields are added
//! by appending new tags, so old logs always decode under newer builds.
//!
//! Decoding never substitutes defaults for malformed fields — truncated or
//! mis-tagged input fails with [`EditError`].

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;

use thiserror::Error;

use crate::NUM_LEVELS;
use crate::comparator::KeyComparator;
use crate::encoding::{self, Decode, Encode, EncodingError};

// Field tags. Append-only: never renumber, never reuse.
const TAG_LOG_NUMBER: u32 = 1;
const TAG_NEXT_FILE_NUMBER: u32 = 2;
const TAG_LAST_SEQUENCE: u32 = 3;
const TAG_COMPACTION_POINTER: u32 = 4;
const TAG_DELETED_FILE: u32 = 5;
const TAG_ADDED_FILE: u32 = 6;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned when decoding an edit record.
#[derive(Debug, Error)]
pub enum EditError {
    /// The byte sequence is not a well-formed edit record.
    #[error("corrupt edit record: {0}")]
    Corrupt(#[from] EncodingError),
}

// ------------------------------------------------------------------------------------------------
// File descriptors
// ------------------------------------------------------------------------------------------------

/// Metadata identifying one immutable sorted data file: its id, size, and
/// the inclusive key range it covers.  The file's contents are never
/// touched by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Globally unique file id, allocated by the version set.
    pub id: u64,

    /// File size in bytes.
    pub size: u64,

    /// Smallest key contained in the file.
    pub smallest: Vec<u8>,

    /// Largest key contained in the file.
    pub largest: Vec<u8>,
}

impl FileMetadata {
    /// Creates a descriptor for a file spanning `[smallest, largest]`.
    pub fn new(
        id: u64,
        size: u64,
        smallest: impl Into<Vec<u8>>,
        largest: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            size,
            smallest: smallest.into(),
            largest: largest.into(),
        }
    }

    /// Whether this file's key range intersects `[smallest, largest]`
    /// under the given ordering.
    pub fn overlaps(&self, cmp: &dyn KeyComparator, smallest: &[u8], largest: &[u8]) -> bool {
        cmp.compare(&self.smallest, largest) != std::cmp::Ordering::Greater
            && cmp.compare(&self.largest, smallest) != std::cmp::Ordering::Less
    }
}

impl Encode for FileMetadata {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.id, buf)?;
        encoding::Encode::encode_to(&self.size, buf)?;
        encoding::Encode::encode_to(&self.smallest, buf)?;
        encoding::Encode::encode_to(&self.largest, buf)?;
        Ok(())
    }
}

impl Decode for FileMetadata {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (id, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (smallest, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        let (largest, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                id,
                size,
                smallest,
                largest,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Version edit
// ------------------------------------------------------------------------------------------------

/// A diff between two file-set layouts.
///
/// Built up through the setter methods, committed through
/// [`VersionSet::log_and_apply`](crate::version_set::VersionSet::log_and_apply).
///
/// Counter fields left unset are stamped from the live counters at commit
/// time so that every persisted edit is self-describing for recovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionEdit {
    /// WAL segment number override.
    pub log_number: Option<u64>,

    /// Next-file-number watermark override.
    pub next_file_number: Option<u64>,

    /// Last-sequence watermark override.
    pub last_sequence: Option<u64>,

    /// Advisory per-level compaction pointers; later entries for the same
    /// level win.
    pub compaction_pointers: Vec<(usize, Vec<u8>)>,

    /// Files to remove, as `(level, file_id)`.
    pub deleted_files: BTreeSet<(usize, u64)>,

    /// Files to insert, as `(level, descriptor)`.
    pub added_files: Vec<(usize, FileMetadata)>,
}

impl VersionEdit {
    /// Creates an empty edit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the WAL segment number recorded with this edit.
    pub fn set_log_number(&mut self, num: u64) {
        self.log_number = Some(num);
    }

    /// Sets the next-file-number watermark recorded with this edit.
    pub fn set_next_file_number(&mut self, num: u64) {
        self.next_file_number = Some(num);
    }

    /// Sets the last-sequence watermark recorded with this edit.
    pub fn set_last_sequence(&mut self, seq: u64) {
        self.last_sequence = Some(seq);
    }

    /// Records the last-compacted key for a level.
    pub fn set_compaction_pointer(&mut self, level: usize, key: impl Into<Vec<u8>>) {
        self.compaction_pointers.push((level, key.into()));
    }

    /// Schedules removal of file `id` from `level`.
    pub fn delete_file(&mut self, level: usize, id: u64) {
        self.deleted_files.insert((level, id));
    }

    /// Schedules insertion of `file` at `level`.
    pub fn add_file(&mut self, level: usize, file: FileMetadata) {
        self.added_files.push((level, file));
    }

    /// Whether the edit carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.log_number.is_none()
            && self.next_file_number.is_none()
            && self.last_sequence.is_none()
            && self.compaction_pointers.is_empty()
            && self.deleted_files.is_empty()
            && self.added_files.is_empty()
    }

    /// Encodes the edit into its tagged wire form.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode_to_vec(self)
    }

    /// Decodes an edit, consuming the entire input.
    ///
    /// Fails with [`EditError`] on truncation, unknown tags, or
    /// out-of-range levels.
    pub fn decode(data: &[u8]) -> Result<Self, EditError> {
        let (edit, _) = Self::decode_from(data)?;
        Ok(edit)
    }
}

/// Decode a level index, rejecting values outside `0..NUM_LEVELS`.
fn decode_level(buf: &[u8]) -> Result<(usize, usize), EncodingError> {
    let (level, n) = u32::decode_from(buf)?;
    if level as usize >= NUM_LEVELS {
        return Err(EncodingError::Custom(format!(
            "level {level} out of range (levels: {NUM_LEVELS})"
        )));
    }
    Ok((level as usize, n))
}

impl Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        if let Some(num) = self.log_number {
            TAG_LOG_NUMBER.encode_to(buf)?;
            num.encode_to(buf)?;
        }
        if let Some(num) = self.next_file_number {
            TAG_NEXT_FILE_NUMBER.encode_to(buf)?;
            num.encode_to(buf)?;
        }
        if let Some(seq) = self.last_sequence {
            TAG_LAST_SEQUENCE.encode_to(buf)?;
            seq.encode_to(buf)?;
        }
        for (level, key) in &self.compaction_pointers {
            TAG_COMPACTION_POINTER.encode_to(buf)?;
            (*level as u32).encode_to(buf)?;
            key.encode_to(buf)?;
        }
        for (level, id) in &self.deleted_files {
            TAG_DELETED_FILE.encode_to(buf)?;
            (*level as u32).encode_to(buf)?;
            id.encode_to(buf)?;
        }
        for (level, file) in &self.added_files {
            TAG_ADDED_FILE.encode_to(buf)?;
            (*level as u32).encode_to(buf)?;
            file.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for VersionEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut edit = VersionEdit::new();
        let mut offset = 0;

        while offset < buf.len() {
            let (tag, n) = u32::decode_from(&buf[offset..])?;
            offset += n;

            match tag {
                TAG_LOG_NUMBER => {
                    let (num, n) = u64::decode_from(&buf[offset..])?;
                    offset += n;
                    edit.log_number = Some(num);
                }
                TAG_NEXT_FILE_NUMBER => {
                    let (num, n) = u64::decode_from(&buf[offset..])?;
                    offset += n;
                    edit.next_file_number = Some(num);
                }
                TAG_LAST_SEQUENCE => {
                    let (seq, n) = u64::decode_from(&buf[offset..])?;
                    offset += n;
                    edit.last_sequence = Some(seq);
                }
                TAG_COMPACTION_POINTER => {
                    let (level, n) = decode_level(&buf[offset..])?;
                    offset += n;
                    let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
                    offset += n;
                    edit.compaction_pointers.push((level, key));
                }
                TAG_DELETED_FILE => {
                    let (level, n) = decode_level(&buf[offset..])?;
                    offset += n;
                    let (id, n) = u64::decode_from(&buf[offset..])?;
                    offset += n;
                    edit.deleted_files.insert((level, id));
                }
                TAG_ADDED_FILE => {
                    let (level, n) = decode_level(&buf[offset..])?;
                    offset += n;
                    let (file, n) = FileMetadata::decode_from(&buf[offset..])?;
                    offset += n;
                    edit.added_files.push((level, file));
                }
                _ => {
                    return Err(EncodingError::InvalidTag {
                        tag,
                        type_name: "VersionEdit",
                    });
                }
            }
        }

        Ok((edit, offset))
    }
}
