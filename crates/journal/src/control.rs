//! Per-source crash-safe checkpoint file.
//!
//! One control file exists per `(target, source-GUID)` pair, named
//! `{guid}` inside the target's watched directory (the braces and hyphens
//! in the name are exactly what keeps the scanner from ever treating it as
//! a segment). It is the sole persistent record of replay progress: the
//! last fully applied segment, the byte offset reached mid-segment, the
//! set of still-open master transactions, and the master database sequence
//! observed at connect time.
//!
//! # Binary Format
//!
//! ```text
//! signature("FBREPLCTL\0", 10) + version(2) + txn_count(4) + sequence(8)
//! + offset(4) + db_sequence(8) + crc32(4)             = 40-byte header
//! { tra_id(8) + sequence(8) } × txn_count + crc32(4)  = record section
//! ```
//!
//! Both CRCs follow the sidecar discipline used elsewhere in the tree: a
//! mismatch is corruption, and control-file corruption is fatal rather
//! than retryable.
//!
//! # Mutual Exclusion
//!
//! An exclusive OS-level lock is held for the lifetime of the handle.
//! Failure to acquire it means another worker is replaying this source;
//! the current sweep gives up and retries later.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use shadow_core::{Result, Sequence, ShadowError, SourceGuid, TxnId};

/// ASCII signature of a control file, NUL-terminated.
pub const CONTROL_SIGNATURE: [u8; 10] = *b"FBREPLCTL\0";

/// Current control file format version.
pub const CONTROL_VERSION: u16 = 1;

const HEADER_SIZE: usize = 40;
const RECORD_SIZE: usize = 16;

/// A master transaction whose BEGIN has been applied but whose END has not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTransaction {
    /// Master transaction number.
    pub tra_id: TxnId,
    /// Sequence of the segment in which the BEGIN was first seen.
    pub sequence: Sequence,
}

/// The lowest first-seen sequence across the active set, if any.
///
/// Segments at or above this sequence must be preserved for crash
/// recovery; everything below is already fully reflected in the replica.
pub fn oldest_sequence(transactions: &[ActiveTransaction]) -> Option<Sequence> {
    transactions.iter().map(|t| t.sequence).min()
}

/// Durable replication state for one source GUID.
#[derive(Debug)]
pub struct ControlFile {
    file: File,
    path: PathBuf,
    sequence: Sequence,
    offset: u32,
    db_sequence: u64,
}

impl ControlFile {
    /// Path of the control file for a source GUID inside `dir`.
    pub fn file_path(dir: &Path, guid: SourceGuid) -> PathBuf {
        dir.join(format!("{{{}}}", guid.hyphenated()))
    }

    /// Open (or create) the control file for `guid` and read its state.
    ///
    /// A missing file is initialized with
    /// `sequence = current_sequence - 1, offset = 0, db_sequence = 0` and
    /// an empty active set. Returns the handle plus the persisted active
    /// transactions. Any validation failure is fatal.
    pub fn open(
        dir: &Path,
        guid: SourceGuid,
        current_sequence: Sequence,
    ) -> Result<(Self, Vec<ActiveTransaction>)> {
        let path = Self::file_path(dir, guid);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| ShadowError::ControlFileLock {
                path: path.display().to_string(),
            })?;

        let length = file.metadata()?.len() as usize;

        let mut control = ControlFile {
            file,
            path,
            sequence: 0,
            offset: 0,
            db_sequence: 0,
        };

        if length == 0 {
            control.sequence = current_sequence.saturating_sub(1);
            control.write_state(&[])?;
            return Ok((control, Vec::new()));
        }

        let transactions = control.read_state(length)?;
        Ok((control, transactions))
    }

    /// Sequence of the last segment replay has reached.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Byte offset reached within `sequence`; zero means the segment is
    /// completely applied.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Master database sequence observed at the last connect.
    pub fn db_sequence(&self) -> u64 {
        self.db_sequence
    }

    /// Record mid-segment progress. Persists only monotone advances:
    /// either a higher sequence, or a higher offset within the same one.
    pub fn save_partial(
        &mut self,
        sequence: Sequence,
        offset: u32,
        transactions: &[ActiveTransaction],
    ) -> Result<()> {
        let update = if sequence > self.sequence {
            self.sequence = sequence;
            self.offset = offset;
            true
        } else if sequence == self.sequence && offset > self.offset {
            self.offset = offset;
            true
        } else {
            false
        };

        if update {
            self.write_state(transactions)?;
        }
        Ok(())
    }

    /// Record the completion of a segment (`offset` returns to zero).
    pub fn save_complete(
        &mut self,
        sequence: Sequence,
        transactions: &[ActiveTransaction],
    ) -> Result<()> {
        if sequence >= self.sequence {
            self.sequence = sequence;
            self.offset = 0;
            self.write_state(transactions)?;
        }
        Ok(())
    }

    /// Reset replay state after the local database was switched or
    /// restored underneath the replica.
    ///
    /// This is the only operation allowed to move the control file
    /// backward: the sequence becomes `db_sequence` with offset zero, the
    /// active set empties, and the new db sequence is recorded.
    pub fn reset(&mut self, db_sequence: u64) -> Result<()> {
        self.sequence = db_sequence;
        self.offset = 0;
        self.db_sequence = db_sequence;
        self.write_state(&[])
    }

    /// Record the master's self-reported replication sequence.
    ///
    /// Only the header is rewritten; the active-transaction records on
    /// disk stay untouched.
    pub fn save_db_sequence(&mut self, db_sequence: u64) -> Result<()> {
        self.db_sequence = db_sequence;

        let txn_count = self.txn_count_on_disk()?;
        let header = self.encode_header(txn_count);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn txn_count_on_disk(&mut self) -> Result<u32> {
        let length = self.file.metadata()?.len() as usize;
        if length < HEADER_SIZE {
            return Ok(0);
        }
        Ok(((length - HEADER_SIZE).saturating_sub(4) / RECORD_SIZE) as u32)
    }

    fn encode_header(&self, txn_count: u32) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..10].copy_from_slice(&CONTROL_SIGNATURE);
        bytes[10..12].copy_from_slice(&CONTROL_VERSION.to_le_bytes());
        bytes[12..16].copy_from_slice(&txn_count.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.offset.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.db_sequence.to_le_bytes());

        let crc = crc32fast::hash(&bytes[..36]);
        bytes[36..40].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn write_state(&mut self, transactions: &[ActiveTransaction]) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + transactions.len() * RECORD_SIZE + 4);
        buf.extend_from_slice(&self.encode_header(transactions.len() as u32));

        let records_start = buf.len();
        for txn in transactions {
            buf.extend_from_slice(&txn.tra_id.to_le_bytes());
            buf.extend_from_slice(&txn.sequence.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf[records_start..]);
        buf.extend_from_slice(&crc.to_le_bytes());

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        self.file.set_len(buf.len() as u64)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn read_state(&mut self, length: usize) -> Result<Vec<ActiveTransaction>> {
        let corrupt = |detail: &str| ShadowError::ControlFileCorrupt {
            path: self.path.display().to_string(),
            detail: detail.to_owned(),
        };

        if length < HEADER_SIZE {
            return Err(corrupt("file shorter than a control header"));
        }

        let mut bytes = Vec::with_capacity(length);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;

        if bytes[0..10] != CONTROL_SIGNATURE {
            return Err(corrupt("bad signature"));
        }

        let version = u16::from_le_bytes(bytes[10..12].try_into().unwrap());
        if version != CONTROL_VERSION {
            return Err(corrupt(&format!("unsupported version {version}")));
        }

        let stored_crc = u32::from_le_bytes(bytes[36..40].try_into().unwrap());
        if stored_crc != crc32fast::hash(&bytes[..36]) {
            return Err(corrupt("header checksum mismatch"));
        }

        let txn_count = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        self.sequence = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        self.offset = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        self.db_sequence = u64::from_le_bytes(bytes[28..36].try_into().unwrap());

        let records_end = HEADER_SIZE + txn_count * RECORD_SIZE;
        if bytes.len() < records_end + 4 {
            return Err(corrupt("truncated active-transaction records"));
        }

        let stored_crc =
            u32::from_le_bytes(bytes[records_end..records_end + 4].try_into().unwrap());
        if stored_crc != crc32fast::hash(&bytes[HEADER_SIZE..records_end]) {
            return Err(corrupt("record checksum mismatch"));
        }

        let mut transactions = Vec::with_capacity(txn_count);
        for chunk in bytes[HEADER_SIZE..records_end].chunks_exact(RECORD_SIZE) {
            transactions.push(ActiveTransaction {
                tra_id: u64::from_le_bytes(chunk[0..8].try_into().unwrap()),
                sequence: u64::from_le_bytes(chunk[8..16].try_into().unwrap()),
            });
        }

        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn fresh_file_starts_one_before_current() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();

        let (control, txns) = ControlFile::open(dir.path(), guid, 5).unwrap();
        assert_eq!(control.sequence(), 4);
        assert_eq!(control.offset(), 0);
        assert_eq!(control.db_sequence(), 0);
        assert!(txns.is_empty());

        // A current sequence of zero must not underflow.
        let guid2 = Uuid::new_v4();
        let (control, _) = ControlFile::open(dir.path(), guid2, 0).unwrap();
        assert_eq!(control.sequence(), 0);
    }

    #[test]
    fn save_partial_then_reopen_is_durable() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let active = vec![
            ActiveTransaction {
                tra_id: 77,
                sequence: 20,
            },
            ActiveTransaction {
                tra_id: 80,
                sequence: 21,
            },
        ];

        {
            let (mut control, _) = ControlFile::open(dir.path(), guid, 20).unwrap();
            control.save_partial(20, 200, &active).unwrap();
        }

        let (control, txns) = ControlFile::open(dir.path(), guid, 20).unwrap();
        assert_eq!(control.sequence(), 20);
        assert_eq!(control.offset(), 200);
        assert_eq!(txns, active);
    }

    #[test]
    fn progress_is_monotone() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();

        let (mut control, _) = ControlFile::open(dir.path(), guid, 10).unwrap();
        control.save_partial(10, 500, &[]).unwrap();

        // Lower offset within the same segment is ignored.
        control.save_partial(10, 100, &[]).unwrap();
        assert_eq!(control.offset(), 500);

        // Lower sequence is ignored.
        control.save_partial(8, 900, &[]).unwrap();
        assert_eq!(control.sequence(), 10);
        assert_eq!(control.offset(), 500);

        // Completion resets the offset.
        control.save_complete(10, &[]).unwrap();
        assert_eq!(control.offset(), 0);

        // Completion of an older segment is ignored.
        control.save_complete(9, &[]).unwrap();
        assert_eq!(control.sequence(), 10);
    }

    #[test]
    fn save_db_sequence_keeps_active_records() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let active = vec![ActiveTransaction {
            tra_id: 7,
            sequence: 3,
        }];

        {
            let (mut control, _) = ControlFile::open(dir.path(), guid, 3).unwrap();
            control.save_partial(3, 64, &active).unwrap();
            control.save_db_sequence(42).unwrap();
        }

        let (control, txns) = ControlFile::open(dir.path(), guid, 3).unwrap();
        assert_eq!(control.db_sequence(), 42);
        assert_eq!(control.sequence(), 3);
        assert_eq!(txns, active);
    }

    #[test]
    fn reset_is_the_only_way_backward() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();

        {
            let (mut control, _) = ControlFile::open(dir.path(), guid, 43).unwrap();
            control
                .save_complete(
                    42,
                    &[ActiveTransaction {
                        tra_id: 9,
                        sequence: 40,
                    }],
                )
                .unwrap();

            // Ordinary saves refuse to roll back.
            control.save_complete(7, &[]).unwrap();
            assert_eq!(control.sequence(), 42);

            control.reset(7).unwrap();
            assert_eq!(control.sequence(), 7);
            assert_eq!(control.offset(), 0);
            assert_eq!(control.db_sequence(), 7);
        }

        let (control, txns) = ControlFile::open(dir.path(), guid, 8).unwrap();
        assert_eq!(control.sequence(), 7);
        assert_eq!(control.db_sequence(), 7);
        assert!(txns.is_empty());
    }

    #[test]
    fn corrupted_signature_is_fatal() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let path = ControlFile::file_path(dir.path(), guid);

        {
            let (mut control, _) = ControlFile::open(dir.path(), guid, 1).unwrap();
            control.save_complete(1, &[]).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'X';
        std::fs::write(&path, &bytes).unwrap();

        let err = ControlFile::open(dir.path(), guid, 1).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn truncated_records_are_fatal() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();
        let path = ControlFile::file_path(dir.path(), guid);

        {
            let (mut control, _) = ControlFile::open(dir.path(), guid, 1).unwrap();
            control
                .save_partial(
                    1,
                    10,
                    &[ActiveTransaction {
                        tra_id: 1,
                        sequence: 1,
                    }],
                )
                .unwrap();
        }

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();

        let err = ControlFile::open(dir.path(), guid, 1).unwrap_err();
        assert!(matches!(err, ShadowError::ControlFileCorrupt { .. }));
    }

    #[test]
    fn exclusive_lock_blocks_second_open() {
        let dir = tempdir().unwrap();
        let guid = Uuid::new_v4();

        let (_held, _) = ControlFile::open(dir.path(), guid, 1).unwrap();

        let err = ControlFile::open(dir.path(), guid, 1).unwrap_err();
        assert!(matches!(err, ShadowError::ControlFileLock { .. }));
    }

    #[test]
    fn control_file_name_is_skipped_by_segment_filter() {
        let guid = Uuid::new_v4();
        let name = ControlFile::file_path(Path::new(""), guid)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();

        assert!(name.contains('{') && name.contains('}') && name.contains('-'));
    }

    #[test]
    fn oldest_sequence_of_active_set() {
        assert_eq!(oldest_sequence(&[]), None);

        let active = [
            ActiveTransaction {
                tra_id: 1,
                sequence: 9,
            },
            ActiveTransaction {
                tra_id: 2,
                sequence: 4,
            },
        ];
        assert_eq!(oldest_sequence(&active), Some(4));
    }
}
