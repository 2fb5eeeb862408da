//! Directory scanning into an ordered replay queue.
//!
//! The scanner walks the source directory once per sweep and keeps only
//! files that are plausibly replayable segments. Everything questionable
//! is skipped with a trace rather than failing the sweep; the single
//! destructive action is deleting FREE-state leftovers from a crashed
//! producer. Survivors are keyed by header sequence: the queue order is
//! the only ordering the replay engine sees, so filename order never
//! matters.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use shadow_core::{Result, Sequence, SourceGuid};
use tracing::debug;

use crate::segment::{SegmentHeader, SegmentState, SEGMENT_HEADER_SIZE};

/// One scanned segment: its path plus the header captured at scan time.
///
/// The replay engine re-reads the header at open time and refuses to
/// proceed if it no longer matches this copy.
#[derive(Debug, Clone)]
pub struct LogSegment {
    /// Location of the segment file.
    pub path: PathBuf,
    /// Header as seen during the scan.
    pub header: SegmentHeader,
}

impl LogSegment {
    /// Remove the segment: delete it, or rename it to `~name` when
    /// preserve mode is enabled.
    pub fn remove(&self, preserve: bool) -> Result<()> {
        if preserve {
            let name = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let renamed = self.path.with_file_name(format!("~{name}"));
            fs::rename(&self.path, &renamed)?;
        } else {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// True for the producer's temporary file naming form.
fn is_producer_temp(name: &str) -> bool {
    name.contains('{') && name.contains('}') && name.contains('-')
}

/// True for I/O errors meaning the producer still holds the file open.
fn is_sharing_violation(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::WouldBlock
    )
}

/// Scan `dir` and build the ordered queue of replayable segments.
///
/// `source_guid`, when configured, filters out segments from any other
/// source. `preserve` skips `~`-prefixed files left by previous
/// preserve-mode removals.
pub fn scan_directory(
    dir: &Path,
    source_guid: Option<SourceGuid>,
    preserve: bool,
) -> Result<BTreeMap<Sequence, LogSegment>> {
    let mut queue = BTreeMap::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();

        // Producer temp files and control files both carry this form.
        if is_producer_temp(&name) {
            continue;
        }

        if preserve && name.starts_with('~') {
            continue;
        }

        let mut file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if is_sharing_violation(&e) => {
                debug!(
                    target: "shadow::journal",
                    file = %path.display(),
                    "skipping file due to sharing violation"
                );
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let file_size = file.metadata()?.len();
        if (file_size as usize) < SEGMENT_HEADER_SIZE {
            debug!(
                target: "shadow::journal",
                file = %path.display(),
                size = file_size,
                "skipping file as being too small for a segment header"
            );
            continue;
        }

        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;

        let header = match SegmentHeader::from_bytes(&header_bytes) {
            Ok(header) => header,
            Err(e) => {
                debug!(
                    target: "shadow::journal",
                    file = %path.display(),
                    error = %e,
                    "skipping file due to unknown format"
                );
                continue;
            }
        };

        if file_size < u64::from(header.total_length) {
            debug!(
                target: "shadow::journal",
                file = %path.display(),
                expected = header.total_length,
                actual = file_size,
                "skipping file as being shorter than its header claims"
            );
            continue;
        }

        if header.state == SegmentState::Free {
            debug!(
                target: "shadow::journal",
                file = %path.display(),
                "deleting stale FREE-state file"
            );
            drop(file);
            fs::remove_file(&path)?;
            continue;
        }

        if !header.state.is_replayable() {
            debug!(
                target: "shadow::journal",
                file = %path.display(),
                state = ?header.state,
                "skipping file in non-replayable state"
            );
            continue;
        }

        if let Some(expected) = source_guid {
            if header.guid != expected {
                debug!(
                    target: "shadow::journal",
                    file = %path.display(),
                    found = %header.guid,
                    "skipping file due to GUID mismatch"
                );
                continue;
            }
        }

        queue.insert(header.sequence, LogSegment { path, header });
    }

    Ok(queue)
}
