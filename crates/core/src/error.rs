//! Error types for the shadowdb replica.
//!
//! All crates share the unified `ShadowError`. Variants map onto four
//! recovery scopes, mirrored by the classification helpers:
//!
//! - **Per-operation recoverable** (`is_conflict`): uniqueness violation on
//!   insert, missing row on update/delete. The applier resolves these in
//!   favor of the master copy and logs a warning.
//! - **Per-segment recoverable**: handled by skip-and-continue inside the
//!   scanner; these never surface as `ShadowError` values.
//! - **Per-sweep** (`is_retryable`): a missing segment, a malformed block,
//!   a failed engine call, control-file I/O. The sweep aborts and the
//!   worker retries after the error timeout.
//! - **Fatal** (`is_fatal`): database not in replica mode, missing
//!   privilege, read-only attachment, corrupted control file. The worker
//!   exits instead of retrying.

use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ShadowError>;

/// Unified error type for the replica pipeline.
#[derive(Debug, Error)]
pub enum ShadowError {
    // ------------------------------------------------------------------
    // Fatal: the worker exits, no retry
    // ------------------------------------------------------------------
    /// The local database is not configured as a replica.
    #[error("database is not in the replica mode")]
    NotReplica,

    /// The attachment lacks the privilege to replicate into the database.
    #[error("missing privilege to replicate into the database")]
    MissingPrivilege,

    /// The local database is attached read-only.
    #[error("replication is impossible for read-only database")]
    ReadOnly,

    /// Control file signature/version/checksum mismatch or short read.
    #[error("control file {path} appears corrupted: {detail}")]
    ControlFileCorrupt {
        /// Path of the offending control file.
        path: String,
        /// What failed to validate.
        detail: String,
    },

    // ------------------------------------------------------------------
    // Per-sweep: abort the sweep, back off, retry
    // ------------------------------------------------------------------
    /// A segment required to continue the gap-free prefix is absent.
    #[error("required segment {sequence} is missing")]
    SequenceGap {
        /// The sequence number that was expected next.
        sequence: u64,
    },

    /// Another worker holds the exclusive lock on the control file.
    #[error("control file {path} lock failed")]
    ControlFileLock {
        /// Path of the contended control file.
        path: String,
    },

    /// A segment header changed between scan time and replay time.
    #[error("segment file {path} was unexpectedly changed")]
    SegmentChanged {
        /// Path of the rewritten segment.
        path: String,
    },

    /// Malformed block or operation stream inside a segment.
    #[error("journal format error: {0}")]
    Format(String),

    /// Underlying file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker was asked to shut down mid-sweep.
    #[error("operation was cancelled")]
    Cancelled,

    // ------------------------------------------------------------------
    // Applier-level hard errors (abort the sweep via the error path)
    // ------------------------------------------------------------------
    /// BEGIN for a transaction number that is already open.
    #[error("transaction {txn} already exists")]
    TxnExists {
        /// Master transaction number.
        txn: u64,
    },

    /// Operation for a transaction number with no open replica transaction.
    #[error("transaction {txn} is not found")]
    TxnNotFound {
        /// Master transaction number.
        txn: u64,
    },

    /// Release/rollback of a savepoint when none is active.
    #[error("transaction {txn} has no savepoints to cleanup")]
    NoSavepoint {
        /// Master transaction number.
        txn: u64,
    },

    /// The named table does not exist on the replica.
    #[error("table {relation} is not found")]
    RelationNotFound {
        /// Table name from the wire.
        relation: String,
    },

    /// The named sequence generator does not exist on the replica.
    #[error("generator {name} is not found")]
    GeneratorNotFound {
        /// Generator name from the wire.
        name: String,
    },

    /// No primary/unique key and no fallback field set for the table.
    #[error("table {relation} has no unique key")]
    NoUniqueKey {
        /// Table name.
        relation: String,
    },

    /// More than one local row matches the semantic key of a row image.
    #[error("record in table {relation} is ambiguously identified using the primary/unique key")]
    AmbiguousKey {
        /// Table name.
        relation: String,
    },

    /// A row image references a blob that was never stored in this
    /// transaction and cannot be inherited from the old row.
    #[error("blob {blob_id} is not found for table {relation}")]
    BlobNotFound {
        /// Master blob id from the row image.
        blob_id: u64,
        /// Table name.
        relation: String,
    },

    /// No historical row format of the table matches the wire image length.
    #[error("record format with length {length} is not found for table {relation}")]
    FormatNotFound {
        /// Wire row image length.
        length: u32,
        /// Table name.
        relation: String,
    },

    /// Uniqueness violation raised by the storage engine on insert.
    ///
    /// This is the trigger for the insert-becomes-update conflict path.
    #[error("violation of unique key constraint in table {relation}")]
    UniqueViolation {
        /// Table name.
        relation: String,
    },

    /// Strict conflict policy rejected a master-copy-wins resolution.
    #[error("record in table {relation} cannot be located via the primary/unique key")]
    ConflictRejected {
        /// Table name.
        relation: String,
    },

    /// Generic storage-engine failure surfaced through the seam.
    #[error("storage engine error: {0}")]
    Engine(String),

    /// Applier-context wrapper identifying a replication failure with the
    /// full interpreted cause chain.
    #[error("Replication error: {source}")]
    Replication {
        /// The underlying failure.
        #[source]
        source: Box<ShadowError>,
    },
}

impl ShadowError {
    /// Wrap an applier failure in the replication context marker.
    ///
    /// Already-wrapped errors are passed through unchanged so the chain is
    /// never nested twice.
    pub fn replication(err: ShadowError) -> Self {
        match err {
            wrapped @ ShadowError::Replication { .. } => wrapped,
            other => ShadowError::Replication {
                source: Box::new(other),
            },
        }
    }

    /// True for errors that must terminate the worker instead of being
    /// retried on the next sweep.
    pub fn is_fatal(&self) -> bool {
        match self {
            ShadowError::NotReplica
            | ShadowError::MissingPrivilege
            | ShadowError::ReadOnly
            | ShadowError::ControlFileCorrupt { .. } => true,
            ShadowError::Replication { source } => source.is_fatal(),
            _ => false,
        }
    }

    /// True for errors that abort the current sweep but are worth retrying
    /// after the error timeout.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// True for the per-operation conflicts the applier resolves itself.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ShadowError::UniqueViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(ShadowError::NotReplica.is_fatal());
        assert!(ShadowError::MissingPrivilege.is_fatal());
        assert!(ShadowError::ReadOnly.is_fatal());
        assert!(ShadowError::ControlFileCorrupt {
            path: "x".into(),
            detail: "bad signature".into(),
        }
        .is_fatal());

        assert!(!ShadowError::SequenceGap { sequence: 11 }.is_fatal());
        assert!(ShadowError::SequenceGap { sequence: 11 }.is_retryable());
    }

    #[test]
    fn fatal_seen_through_replication_wrapper() {
        let err = ShadowError::replication(ShadowError::ReadOnly);
        assert!(err.is_fatal());

        let err = ShadowError::replication(ShadowError::TxnNotFound { txn: 7 });
        assert!(!err.is_fatal());
    }

    #[test]
    fn replication_wrapper_is_not_nested() {
        let once = ShadowError::replication(ShadowError::TxnNotFound { txn: 7 });
        let twice = ShadowError::replication(once);
        match twice {
            ShadowError::Replication { source } => {
                assert!(matches!(*source, ShadowError::TxnNotFound { txn: 7 }));
            }
            other => panic!("expected Replication wrapper, got {other:?}"),
        }
    }

    #[test]
    fn gap_message_matches_log_format() {
        let err = ShadowError::SequenceGap { sequence: 11 };
        assert_eq!(err.to_string(), "required segment 11 is missing");
    }
}
