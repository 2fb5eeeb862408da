//! The per-target replay sweep.
//!
//! One sweep scans the source directory into an ordered queue and walks it
//! in sequence order. For each segment the engine decides between
//! fast-forward (already present in the local database), resync (the local
//! database was switched or restored), pre-deletion (below the safety
//! threshold), gap abort (a required sequence is missing), and replay.
//!
//! Replay feeds blocks to the applier one at a time, maintains the active
//! master-transaction set on BEGIN/END boundaries, and checkpoints the
//! control file after every block. Blocks lying before the durable
//! checkpoint are re-read in *rewind mode*: they reach the applier only if
//! their transaction was active at the checkpoint, which rebuilds
//! in-memory transaction state without double-applying anything.

use std::io::Read;

use shadow_core::{Result, Sequence, ShadowError};
use shadow_journal::{
    oldest_sequence, scan_directory, ActiveTransaction, BlockHeader, ControlFile, LogSegment,
    SegmentHeader, BLOCK_BEGIN_TRANS, BLOCK_END_TRANS, BLOCK_HEADER_SIZE, SEGMENT_HEADER_SIZE,
};
use tracing::info;

use crate::target::Target;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStatus {
    /// Nothing to do; sleep for the idle timeout.
    Suspend,
    /// Progress was made; sweep again immediately.
    Continue,
    /// The sweep failed; sleep for the error timeout and retry.
    Error,
    /// The failure is not retryable; the worker must exit.
    Fatal,
}

/// Counters accumulated over one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    /// Segments accepted into the queue.
    pub segments_queued: usize,
    /// Segments fully replayed.
    pub segments_replayed: usize,
    /// Segments deleted (fast-forward, threshold, or after replay).
    pub segments_deleted: usize,
    /// Segments kept alive for still-open transactions.
    pub segments_preserved: usize,
    /// Blocks handed to the applier.
    pub blocks_applied: usize,
}

/// Run one sweep, converting failures into a status.
pub fn process_archive(target: &mut Target) -> SweepStatus {
    match sweep(target) {
        Ok((status, stats)) => {
            if status == SweepStatus::Continue {
                info!(
                    target: "shadow::replica",
                    database = %target.config().name,
                    segments_replayed = stats.segments_replayed,
                    segments_deleted = stats.segments_deleted,
                    segments_preserved = stats.segments_preserved,
                    blocks_applied = stats.blocks_applied,
                    "sweep complete"
                );
            }
            status
        }
        Err(e) => {
            let fatal = e.is_fatal();
            let message = e.to_string();

            // The applier already reported anything it wrapped in the
            // replication context; avoid double logging those.
            if !message.contains("Replication") {
                target.log_error(&message);
            }

            if fatal {
                SweepStatus::Fatal
            } else {
                SweepStatus::Error
            }
        }
    }
}

fn sweep(target: &mut Target) -> Result<(SweepStatus, SweepStats)> {
    let dir = target.config().source_directory.clone();
    let preserve = target.config().preserve_segments;
    let source_guid = target.config().source_guid;

    target.verbose(format!("scanning directory ({})", dir.display()));

    let queue = scan_directory(&dir, source_guid, preserve)?;

    let mut stats = SweepStats::default();
    let mut status = SweepStatus::Suspend;

    if queue.is_empty() {
        target.verbose("no suitable files found".into());
        return Ok((status, stats));
    }

    let segments: Vec<LogSegment> = queue.into_values().collect();
    stats.segments_queued = segments.len();
    target.verbose(format!(
        "added {} segments to the processing queue",
        segments.len()
    ));

    let mut buffer: Vec<u8> = Vec::new();
    let mut next_sequence: Sequence = 0;
    let restart = target.is_shutdown();

    for position in 0..segments.len() {
        let segment = &segments[position];
        let sequence = segment.header.sequence;

        let (mut control, mut transactions) =
            ControlFile::open(&dir, segment.header.guid, sequence)?;

        let mut last_sequence = control.sequence();
        let mut last_offset = control.offset();

        let db_sequence = target.init_replica()?;
        let last_db_sequence = control.db_sequence();

        // Fast-forward: the local database already contains this segment.
        if sequence <= db_sequence {
            target.verbose(format!(
                "deleting file ({}) due to fast forward",
                segment.path.display()
            ));
            segment.remove(preserve)?;
            stats.segments_deleted += 1;
            continue;
        }

        // Resync: the local database was switched or restored underneath
        // us. The only legitimate rollback of the control file.
        if db_sequence != last_db_sequence {
            target.verbose(format!(
                "resetting replication to continue from segment {}",
                db_sequence + 1
            ));
            control.reset(db_sequence)?;
            transactions.clear();
            last_sequence = db_sequence;
            last_offset = 0;
        }

        let mut oldest = oldest_sequence(&transactions);

        let threshold = oldest.unwrap_or(if last_offset != 0 {
            last_sequence
        } else {
            last_sequence + 1
        });

        // Below the threshold nothing in this segment can be needed.
        if sequence < threshold {
            target.verbose(format!(
                "deleting file ({}) as priorly replicated",
                segment.path.display()
            ));
            segment.remove(preserve)?;
            stats.segments_deleted += 1;
            continue;
        }

        if next_sequence == 0 {
            next_sequence = if restart {
                threshold
            } else {
                last_sequence + 1
            };
        }

        if sequence > next_sequence {
            return Err(ShadowError::SequenceGap {
                sequence: next_sequence,
            });
        }

        if sequence < next_sequence {
            continue;
        }

        target.verbose(format!(
            "replicating file ({}), segment {sequence}",
            segment.path.display()
        ));

        let org_oldest = oldest;

        let mut file = match std::fs::File::open(&segment.path) {
            Ok(file) => file,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::WouldBlock
                ) =>
            {
                target.verbose(format!(
                    "stopping to process the queue, sharing violation for file ({})",
                    segment.path.display()
                ));
                break;
            }
            Err(e) => return Err(e.into()),
        };

        // The header must still be the one captured at scan time.
        let mut header_bytes = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)
            .map_err(|e| ShadowError::Format(e.to_string()))?;
        if header != segment.header {
            return Err(ShadowError::SegmentChanged {
                path: segment.path.display().to_string(),
            });
        }

        let segment_length = u64::from(segment.header.total_length);
        let mut total_length = SEGMENT_HEADER_SIZE as u64;

        while total_length < segment_length {
            target.check_cancelled()?;

            let mut block_header_bytes = [0u8; BLOCK_HEADER_SIZE];
            file.read_exact(&mut block_header_bytes)?;
            let block_header = BlockHeader::from_bytes(&block_header_bytes)?;

            let block_length =
                block_header.data_length as usize + block_header.meta_length as usize;
            let length = BLOCK_HEADER_SIZE + block_length;

            if total_length + length as u64 > segment_length {
                return Err(ShadowError::Format(format!(
                    "block at offset {total_length} crosses the end of segment {sequence}"
                )));
            }

            if block_length > 0 {
                let rewind = sequence < last_sequence
                    || (sequence == last_sequence
                        && (last_offset == 0 || (total_length as u32) < last_offset));

                buffer.clear();
                buffer.extend_from_slice(&block_header_bytes);
                buffer.resize(length, 0);
                file.read_exact(&mut buffer[BLOCK_HEADER_SIZE..])?;

                if let Err(e) =
                    replicate_block(target, sequence, &mut transactions, &buffer, rewind)
                {
                    let oldest = oldest_sequence(&transactions);
                    target.verbose(format!(
                        "last segment:offset {}:{}, oldest segment {}",
                        control.sequence(),
                        control.offset(),
                        oldest.unwrap_or(0)
                    ));
                    return Err(e);
                }
                stats.blocks_applied += 1;
            }

            total_length += length as u64;
            control.save_partial(sequence, total_length as u32, &transactions)?;
        }

        control.save_complete(sequence, &transactions)?;
        drop(file);

        target.verbose(format!(
            "successfully replicated {total_length} bytes in segment {sequence}"
        ));
        stats.segments_replayed += 1;

        oldest = oldest_sequence(&transactions);
        next_sequence = sequence + 1;

        target.verbose(format!(
            "last segment:offset {}:{}, oldest segment {}",
            control.sequence(),
            control.offset(),
            oldest.unwrap_or(0)
        ));

        // Terminated transactions may have released a queue prefix:
        // everything before the new oldest active sequence (and before
        // this segment) is now garbage.
        if let Some(org) = org_oldest {
            if oldest != org_oldest {
                let gc_threshold = oldest.map_or(sequence, |o| o.min(sequence));

                for other in &segments[..position] {
                    let other_sequence = other.header.sequence;
                    if other_sequence >= org && other_sequence < gc_threshold {
                        target.verbose(format!(
                            "deleting file ({}) as already replicated",
                            other.path.display()
                        ));
                        other.remove(preserve)?;
                        stats.segments_deleted += 1;
                    }
                }
            }
        }

        if oldest.is_some() {
            target.verbose(format!(
                "preserving file ({}) due to uncommitted transactions",
                segment.path.display()
            ));
            stats.segments_preserved += 1;
        } else {
            target.verbose(format!(
                "deleting file ({}) as already replicated",
                segment.path.display()
            ));
            segment.remove(preserve)?;
            stats.segments_deleted += 1;
        }

        status = SweepStatus::Continue;
    }

    Ok((status, stats))
}

/// Apply one block and maintain the active-transaction set.
///
/// In rewind mode the block reaches the applier only if it is
/// non-transactional or its transaction was active at the checkpoint.
fn replicate_block(
    target: &mut Target,
    sequence: Sequence,
    transactions: &mut Vec<ActiveTransaction>,
    block: &[u8],
    rewind: bool,
) -> Result<()> {
    let header = BlockHeader::from_bytes(block)?;
    let tra = header.tra_number;

    if !rewind || tra == 0 || transactions.iter().any(|t| t.tra_id == tra) {
        target.replicate(block)?;
    }

    if header.flags & BLOCK_END_TRANS != 0 {
        if tra != 0 {
            transactions.retain(|t| t.tra_id != tra);
        } else if !rewind {
            // A non-transactional END is a global boundary: every master
            // transaction is finished.
            transactions.clear();
        }
    } else if header.flags & BLOCK_BEGIN_TRANS != 0 && !rewind
        && !transactions.iter().any(|t| t.tra_id == tra)
    {
        transactions.push(ActiveTransaction {
            tra_id: tra,
            sequence,
        });
    }

    Ok(())
}
