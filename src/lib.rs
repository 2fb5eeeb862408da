//! # shadowdb
//!
//! The replica side of a database change-stream replication pipeline.
//!
//! A primary database publishes committed transactions as an ordered log
//! of journal segments into a shared directory. shadowdb discovers those
//! segments, replays them against a local database copy in sequence
//! order, survives crashes through a per-source control file, and
//! reconciles benign conflicts in favor of the master's copy.
//!
//! # Quick Start
//!
//! ```no_run
//! use shadowdb::{DatabaseProvider, ReplicaServer, Target, TargetConfig};
//! use shadowdb::storage::{MemoryEngine, ReplicaDatabase};
//!
//! fn main() -> shadowdb::Result<()> {
//!     let engine = MemoryEngine::new();
//!     let provider = move || -> shadowdb::Result<Box<dyn ReplicaDatabase>> {
//!         Ok(Box::new(engine.clone()))
//!     };
//!
//!     let config = TargetConfig::new("replica1", "/var/journal/archive");
//!     let server = ReplicaServer::start(vec![Target::new(config, Box::new(provider))]);
//!
//!     // ... run until a shutdown signal ...
//!     server.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `shadow-journal` | segment/block wire formats, control file, scanner |
//! | `shadow-storage` | the local database seam + in-memory test engine |
//! | `shadow-apply` | the applier: transactions, conflicts, blobs |
//! | `shadow-replica` | replay engine, worker supervision, config |
//!
//! Replay progress lives only in the per-source control file; the local
//! database's own transactional machinery provides atomicity for each
//! block's effects.

pub use shadow_apply::{Applier, ConflictPolicy, FallbackKeys};
pub use shadow_core::{Result, Sequence, ShadowError, SourceGuid, TxnId};
pub use shadow_replica::{
    load_targets, process_archive, DatabaseProvider, ReplicaServer, SweepStats, SweepStatus,
    Target, TargetConfig,
};

/// Journal formats and readers.
pub use shadow_journal as journal;

/// The local database seam and the in-memory engine.
pub use shadow_storage as storage;
