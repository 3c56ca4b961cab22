//! The manifest — a durable, append-only log of file-set transitions.
//!
//! The manifest is what makes version transitions crash-consistent: every
//! edit is appended and fsynced here **before** the version set publishes
//! the successor layout, so the log is always a faithful replay source for
//! the in-memory state.
//!
//! # On-disk layout
//!
//! A database directory holds one pointer file and one or more segments:
//!
//! ```text
//! CURRENT            — text file naming the active segment
//! MANIFEST-000001    — segment: header, then framed records
//! ```
//!
//! Segment format:
//!
//! ```text
//! [HEADER_BYTES][HEADER_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ...
//! ```
//!
//! The first record of every segment is a [`BaseState`] — the complete
//! file-set layout at segment-creation time — so a segment is always
//! self-contained: recovery reads exactly one segment, never a chain.
//! Subsequent records are [`VersionEdit`]s in commit order.
//!
//! # Rotation
//!
//! When the active segment outgrows its threshold, the version set writes
//! a fresh segment (base state first), syncs it, and only then swaps
//! `CURRENT` via write-temp + atomic-rename + directory-fsync.  A crash at
//! any point leaves `CURRENT` naming a complete, self-contained segment.
//!
//! # Crash tolerance on recovery
//!
//! Appends are sequential, so the only frame a clean crash can damage is
//! the final one.  Recovery therefore tolerates a truncated or
//! checksum-corrupt frame **at the physical end** of the segment and
//! treats it as end-of-log; a bad frame with more data behind it cannot be
//! a torn append and is reported as corruption.
//!
//! # Synchronization
//!
//! Unlike a general-purpose WAL, `ManifestLog` is not internally locked:
//! the version set already serializes commits, and recovery runs before
//! any concurrency exists.

#[cfg(test)]
mod tests;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::edit::{FileMetadata, VersionEdit};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::storage::{SequentialFile, Storage};
use crate::version::Version;

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Name of the pointer file that designates the active segment.
pub const CURRENT_FILE: &str = "CURRENT";

const CURRENT_TMP_FILE: &str = "CURRENT.tmp";
const SEGMENT_PREFIX: &str = "MANIFEST-";

/// Segment header: magic + format version, then a CRC32 of those bytes.
const MAGIC: [u8; 4] = *b"MFST";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = MAGIC.len() + U32_SIZE + U32_SIZE;

/// Upper bound on a single framed record (64 MiB).  A length prefix above
/// this is structural corruption, not a large record.
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying I/O error, propagated verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding error while serializing a record.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The log is structurally invalid: bad header, checksum mismatch
    /// before the final record, undecodable payload, or a missing leading
    /// base-state record.
    #[error("corrupt manifest: {0}")]
    Corrupt(String),

    /// A record exceeded [`MAX_RECORD_LEN`] on the write path.
    #[error("record size {0} exceeds limit")]
    RecordTooLarge(usize),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// File name of manifest segment `number`, e.g. `MANIFEST-000007`.
pub fn segment_file_name(number: u64) -> String {
    format!("{SEGMENT_PREFIX}{number:06}")
}

/// Parse a segment number back out of a segment file name.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// Complete file-set state written as the first record of every segment.
///
/// Carries everything recovery needs to reconstruct a [`Version`] and the
/// global counters without reading any earlier segment.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseState {
    /// Name of the key ordering the database was created under.
    pub comparator_name: String,

    /// WAL segment number at capture time.
    pub log_number: u64,

    /// Next-file-number watermark at capture time.
    pub next_file_number: u64,

    /// Last-sequence watermark at capture time.
    pub last_sequence: u64,

    /// Per-level compaction pointers, as `(level, key)`.
    pub compaction_pointers: Vec<(u32, Vec<u8>)>,

    /// Every live file, as `(level, descriptor)`.
    pub files: Vec<(u32, FileMetadata)>,
}

impl BaseState {
    /// Captures a version plus counters into a base record.
    pub fn capture(
        version: &Version,
        log_number: u64,
        next_file_number: u64,
        last_sequence: u64,
    ) -> Self {
        let mut compaction_pointers = Vec::new();
        let mut files = Vec::new();
        for level in 0..crate::NUM_LEVELS {
            if let Some(key) = version.compaction_pointer(level) {
                compaction_pointers.push((level as u32, key.to_vec()));
            }
            for file in version.files(level) {
                files.push((level as u32, FileMetadata::clone(file)));
            }
        }
        Self {
            comparator_name: version.comparator().name().to_string(),
            log_number,
            next_file_number,
            last_sequence,
            compaction_pointers,
            files,
        }
    }

    /// Re-expresses the captured state as an edit against an empty layout.
    ///
    /// Recovery folds this edit into [`Version::empty`], which re-validates
    /// every level invariant on the way in.
    pub fn to_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.set_log_number(self.log_number);
        edit.set_next_file_number(self.next_file_number);
        edit.set_last_sequence(self.last_sequence);
        for (level, key) in &self.compaction_pointers {
            edit.set_compaction_pointer(*level as usize, key.clone());
        }
        for (level, file) in &self.files {
            edit.add_file(*level as usize, file.clone());
        }
        edit
    }
}

impl Encode for BaseState {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.comparator_name, buf)?;
        encoding::Encode::encode_to(&self.log_number, buf)?;
        encoding::Encode::encode_to(&self.next_file_number, buf)?;
        encoding::Encode::encode_to(&self.last_sequence, buf)?;
        encoding::len_to_u32(self.compaction_pointers.len())?.encode_to(buf)?;
        for (level, key) in &self.compaction_pointers {
            level.encode_to(buf)?;
            key.encode_to(buf)?;
        }
        encoding::len_to_u32(self.files.len())?.encode_to(buf)?;
        for (level, file) in &self.files {
            level.encode_to(buf)?;
            file.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for BaseState {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (comparator_name, n) = String::decode_from(&buf[offset..])?;
        offset += n;
        let (log_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (next_file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (last_sequence, n) = u64::decode_from(&buf[offset..])?;
        offset += n;

        let (pointer_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if pointer_count > encoding::MAX_VEC_ELEMENTS {
            return Err(EncodingError::LengthOverflow(format!(
                "compaction pointer count {pointer_count} exceeds limit"
            )));
        }
        let mut compaction_pointers = Vec::with_capacity(pointer_count as usize);
        for _ in 0..pointer_count {
            let (level, n) = u32::decode_from(&buf[offset..])?;
            offset += n;
            let (key, n) = <Vec<u8>>::decode_from(&buf[offset..])?;
            offset += n;
            compaction_pointers.push((level, key));
        }

        let (file_count, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        if file_count > encoding::MAX_VEC_ELEMENTS {
            return Err(EncodingError::LengthOverflow(format!(
                "file count {file_count} exceeds limit"
            )));
        }
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let (level, n) = u32::decode_from(&buf[offset..])?;
            offset += n;
            let (file, n) = FileMetadata::decode_from(&buf[offset..])?;
            offset += n;
            files.push((level, file));
        }

        Ok((
            Self {
                comparator_name,
                log_number,
                next_file_number,
                last_sequence,
                compaction_pointers,
                files,
            },
            offset,
        ))
    }
}

/// One record in a manifest segment.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRecord {
    /// Full state at segment creation; always the first record.
    Base(BaseState),

    /// One committed file-set transition.
    Edit(VersionEdit),
}

impl Encode for ManifestRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            ManifestRecord::Base(base) => {
                encoding::Encode::encode_to(&0u32, buf)?;
                base.encode_to(buf)?;
            }
            ManifestRecord::Edit(edit) => {
                encoding::Encode::encode_to(&1u32, buf)?;
                edit.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl Decode for ManifestRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (tag, n) = u32::decode_from(buf)?;
        offset += n;
        match tag {
            0 => {
                let (base, n) = BaseState::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestRecord::Base(base), offset))
            }
            1 => {
                let (edit, n) = VersionEdit::decode_from(&buf[offset..])?;
                offset += n;
                Ok((ManifestRecord::Edit(edit), offset))
            }
            _ => Err(EncodingError::InvalidTag {
                tag,
                type_name: "ManifestRecord",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery result
// ------------------------------------------------------------------------------------------------

/// Everything read back from the active segment.
#[derive(Debug)]
pub struct RecoveredManifest {
    /// The segment's leading base state.
    pub base: BaseState,

    /// Committed edits after the base, in log order.
    pub edits: Vec<VersionEdit>,

    /// Number of the segment that was read.
    pub segment_number: u64,

    /// Physical size of the segment, including any ignored tail bytes.
    pub segment_size: u64,

    /// False when a torn frame was ignored at the end of the segment.
    /// The version set must not append after such a tail; it rotates to a
    /// fresh segment instead.
    pub clean_tail: bool,
}

// ------------------------------------------------------------------------------------------------
// Manifest log core
// ------------------------------------------------------------------------------------------------

/// Writer for the active manifest segment.
///
/// Writes are externally serialized by the version set's commit section;
/// see the module docs.
pub struct ManifestLog {
    dir: PathBuf,
    storage: Arc<dyn Storage>,
    file: Box<dyn SequentialFile>,
    segment_number: u64,
    written: u64,
}

impl std::fmt::Debug for ManifestLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestLog")
            .field("dir", &self.dir)
            .field("segment_number", &self.segment_number)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl ManifestLog {
    /// Creates a fresh segment and writes its header.
    ///
    /// The caller must append a [`ManifestRecord::Base`] before publishing
    /// the segment through [`ManifestLog::publish_current`].
    pub fn create(
        dir: &Path,
        storage: Arc<dyn Storage>,
        segment_number: u64,
    ) -> Result<Self, ManifestError> {
        let path = dir.join(segment_file_name(segment_number));
        let mut file = storage.create(&path)?;

        let mut header = Vec::with_capacity(HEADER_LEN);
        MAGIC.encode_to(&mut header)?;
        FORMAT_VERSION.encode_to(&mut header)?;
        let mut hasher = Crc32::new();
        hasher.update(&header);
        let checksum = hasher.finalize();
        header.extend_from_slice(&checksum.to_le_bytes());

        file.append(&header)?;
        file.sync()?;

        info!(segment = segment_number, path = %path.display(), "created manifest segment");

        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            file,
            segment_number,
            written: header.len() as u64,
        })
    }

    /// Reopens the active segment for appending after a clean recovery.
    pub fn reopen(
        dir: &Path,
        storage: Arc<dyn Storage>,
        segment_number: u64,
    ) -> Result<Self, ManifestError> {
        let path = dir.join(segment_file_name(segment_number));
        let written = storage.size(&path)?;
        let file = storage.open_append(&path)?;

        debug!(segment = segment_number, written, "reopened manifest segment");

        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            file,
            segment_number,
            written,
        })
    }

    /// Appends one record and syncs it to stable storage.
    ///
    /// Returns only after the bytes are durable; a success here is the
    /// commit point of the enclosing transition.
    pub fn append_record(&mut self, record: &ManifestRecord) -> Result<(), ManifestError> {
        let payload = encoding::encode_to_vec(record)?;
        if payload.len() > MAX_RECORD_LEN as usize {
            return Err(ManifestError::RecordTooLarge(payload.len()));
        }
        let len = payload.len() as u32;

        let mut hasher = Crc32::new();
        hasher.update(&len.to_le_bytes());
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(payload.len() + 2 * U32_SIZE);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&checksum.to_le_bytes());

        self.file.append(&frame)?;
        self.file.sync()?;
        self.written += frame.len() as u64;

        debug!(
            "appended {len}-byte record to segment {} (checksum {checksum:08x})",
            self.segment_number
        );
        Ok(())
    }

    /// Bytes written to the active segment so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Number of the active segment.
    pub fn segment_number(&self) -> u64 {
        self.segment_number
    }

    /// Path of the active segment file.
    pub fn segment_path(&self) -> PathBuf {
        self.dir.join(segment_file_name(self.segment_number))
    }

    // --------------------------------------------------------------------
    // Pointer file
    // --------------------------------------------------------------------

    /// Atomically points `CURRENT` at `segment_number`.
    ///
    /// Write-temp, sync, rename, directory-sync — after a crash the pointer
    /// names either the old segment or the new one, never a partial write.
    pub fn publish_current(
        dir: &Path,
        storage: &dyn Storage,
        segment_number: u64,
    ) -> Result<(), ManifestError> {
        let tmp_path = dir.join(CURRENT_TMP_FILE);
        let current_path = dir.join(CURRENT_FILE);

        let mut tmp = storage.create(&tmp_path)?;
        tmp.append(format!("{}\n", segment_file_name(segment_number)).as_bytes())?;
        tmp.sync()?;
        drop(tmp);

        storage.rename(&tmp_path, &current_path)?;
        storage.sync_dir(dir)?;

        info!(segment = segment_number, "published CURRENT");
        Ok(())
    }

    /// Reads `CURRENT` and returns the active segment number, or `None`
    /// when the database directory is fresh.
    pub fn read_current(dir: &Path, storage: &dyn Storage) -> Result<Option<u64>, ManifestError> {
        let current_path = dir.join(CURRENT_FILE);
        if !storage.exists(&current_path) {
            return Ok(None);
        }

        let raw = storage.read(&current_path)?;
        let name = std::str::from_utf8(&raw)
            .map_err(|_| ManifestError::Corrupt("CURRENT is not valid UTF-8".into()))?
            .trim();
        let number = parse_segment_file_name(name).ok_or_else(|| {
            ManifestError::Corrupt(format!("CURRENT names invalid segment {name:?}"))
        })?;
        Ok(Some(number))
    }

    // --------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------

    /// Reads the active segment back into a base state plus replay edits.
    ///
    /// Requires `CURRENT` to exist; fresh-directory bootstrap is the
    /// version set's concern.  See the module docs for the tail-tolerance
    /// rules.
    pub fn recover(dir: &Path, storage: &dyn Storage) -> Result<RecoveredManifest, ManifestError> {
        let segment_number = Self::read_current(dir, storage)?
            .ok_or_else(|| ManifestError::Corrupt("CURRENT pointer file missing".into()))?;

        let path = dir.join(segment_file_name(segment_number));
        let data = storage.read(&path)?;
        Self::check_header(&data)?;

        let mut offset = HEADER_LEN;
        let mut base: Option<BaseState> = None;
        let mut edits = Vec::new();
        let mut clean_tail = true;

        while offset < data.len() {
            let (payload, end) = match read_frame(&data, offset) {
                FrameOutcome::Complete { payload, end } => (payload, end),
                FrameOutcome::Truncated => {
                    // A torn final append; everything before it is intact.
                    warn!(
                        segment = segment_number,
                        offset, "ignoring truncated record at end of manifest"
                    );
                    clean_tail = false;
                    break;
                }
                FrameOutcome::BadChecksum { end } => {
                    if end == data.len() {
                        warn!(
                            segment = segment_number,
                            offset, "ignoring checksum-corrupt record at end of manifest"
                        );
                        clean_tail = false;
                        break;
                    }
                    return Err(ManifestError::Corrupt(format!(
                        "checksum mismatch at offset {offset} with {} bytes following",
                        data.len() - end
                    )));
                }
                FrameOutcome::LengthOverflow { len } => {
                    return Err(ManifestError::Corrupt(format!(
                        "record length {len} at offset {offset} exceeds limit"
                    )));
                }
            };

            let record = decode_record(payload)
                .map_err(|e| ManifestError::Corrupt(format!("bad record at offset {offset}: {e}")))?;

            match record {
                ManifestRecord::Base(state) => {
                    if base.is_some() {
                        return Err(ManifestError::Corrupt(format!(
                            "unexpected base-state record at offset {offset}"
                        )));
                    }
                    base = Some(state);
                }
                ManifestRecord::Edit(edit) => {
                    if base.is_none() {
                        return Err(ManifestError::Corrupt(
                            "first record is not a base state".into(),
                        ));
                    }
                    edits.push(edit);
                }
            }

            offset = end;
        }

        let base = base.ok_or_else(|| {
            ManifestError::Corrupt("segment contains no base-state record".into())
        })?;

        info!(
            segment = segment_number,
            edits = edits.len(),
            files = base.files.len(),
            clean_tail,
            "recovered manifest"
        );

        Ok(RecoveredManifest {
            base,
            edits,
            segment_number,
            segment_size: data.len() as u64,
            clean_tail,
        })
    }

    /// Validate the segment header and its checksum.
    fn check_header(data: &[u8]) -> Result<(), ManifestError> {
        if data.len() < HEADER_LEN {
            return Err(ManifestError::Corrupt(format!(
                "segment shorter than header ({} bytes)",
                data.len()
            )));
        }

        let body = &data[..HEADER_LEN - U32_SIZE];
        let mut hasher = Crc32::new();
        hasher.update(body);
        let computed = hasher.finalize();

        let mut stored_bytes = [0u8; U32_SIZE];
        stored_bytes.copy_from_slice(&data[HEADER_LEN - U32_SIZE..HEADER_LEN]);
        let stored = u32::from_le_bytes(stored_bytes);
        if stored != computed {
            return Err(ManifestError::Corrupt("header checksum mismatch".into()));
        }

        let (magic, n) = <[u8; 4]>::decode_from(body)?;
        if magic != MAGIC {
            return Err(ManifestError::Corrupt("bad magic".into()));
        }
        let (version, _) = u32::decode_from(&body[n..])?;
        if version != FORMAT_VERSION {
            return Err(ManifestError::Corrupt(format!(
                "unsupported format version {version}"
            )));
        }
        Ok(())
    }

    /// Removes a no-longer-referenced segment file.  Failure is logged and
    /// swallowed — an orphaned segment wastes space but harms nothing.
    pub fn remove_segment(dir: &Path, storage: &dyn Storage, segment_number: u64) {
        let path = dir.join(segment_file_name(segment_number));
        match storage.remove(&path) {
            Ok(()) => info!(segment = segment_number, "removed obsolete manifest segment"),
            Err(e) => warn!(
                segment = segment_number,
                "failed to remove obsolete manifest segment: {e}"
            ),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Frame scanning
// ------------------------------------------------------------------------------------------------

enum FrameOutcome<'a> {
    /// A complete frame with a valid checksum.
    Complete { payload: &'a [u8], end: usize },
    /// The remaining bytes are shorter than the frame claims.
    Truncated,
    /// A complete frame whose checksum does not match; `end` is where the
    /// frame finishes, used to decide whether it is the segment's tail.
    BadChecksum { end: usize },
    /// The length prefix itself is beyond any legal record size.
    LengthOverflow { len: u32 },
}

/// Reads one `[len][payload][crc]` frame starting at `offset`.
fn read_frame(data: &[u8], offset: usize) -> FrameOutcome<'_> {
    let rest = &data[offset..];
    if rest.len() < U32_SIZE {
        return FrameOutcome::Truncated;
    }

    let mut len_bytes = [0u8; U32_SIZE];
    len_bytes.copy_from_slice(&rest[..U32_SIZE]);
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_RECORD_LEN {
        // Could be a torn length field; but if the claimed length also
        // exceeds what is physically present, truncation is the simpler
        // explanation and the tail rule applies.
        if (rest.len() - U32_SIZE) < len as usize {
            return FrameOutcome::Truncated;
        }
        return FrameOutcome::LengthOverflow { len };
    }

    let frame_len = U32_SIZE + len as usize + U32_SIZE;
    if rest.len() < frame_len {
        return FrameOutcome::Truncated;
    }

    let payload = &rest[U32_SIZE..U32_SIZE + len as usize];
    let mut stored_bytes = [0u8; U32_SIZE];
    stored_bytes.copy_from_slice(&rest[U32_SIZE + len as usize..frame_len]);
    let stored = u32::from_le_bytes(stored_bytes);

    let mut hasher = Crc32::new();
    hasher.update(&len_bytes);
    hasher.update(payload);
    if hasher.finalize() != stored {
        return FrameOutcome::BadChecksum {
            end: offset + frame_len,
        };
    }

    FrameOutcome::Complete {
        payload,
        end: offset + frame_len,
    }
}

/// Decode a record payload, requiring every byte to be consumed.
fn decode_record(payload: &[u8]) -> Result<ManifestRecord, EncodingError> {
    let (record, consumed) = ManifestRecord::decode_from(payload)?;
    if consumed != payload.len() {
        return Err(EncodingError::Custom(format!(
            "{} trailing bytes in record payload",
            payload.len() - consumed
        )));
    }
    Ok(record)
}
