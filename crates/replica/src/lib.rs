//! The replica-side driver: per-target replay engine and worker
//! supervision.
//!
//! Each configured target gets one long-lived worker thread. A worker
//! sweeps the source directory, replays eligible segments block-by-block
//! through the applier, checkpoints progress in the control file after
//! every block, and deletes segments once nothing can ever need them
//! again. Between sweeps it sleeps with idle or error backoff and watches
//! the process-wide shutdown flag.

pub mod config;
pub mod engine;
pub mod target;
pub mod worker;

pub use config::{load_targets, TargetConfig};
pub use engine::{process_archive, SweepStats, SweepStatus};
pub use target::{DatabaseProvider, Target};
pub use worker::ReplicaServer;
