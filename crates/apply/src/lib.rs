//! The change applier: a transactional state machine that consumes the
//! decoded operation stream of one block and executes it against a local
//! database attachment.
//!
//! The applier owns the map of in-flight replica transactions and resolves
//! benign conflicts in favor of the master's copy: an insert that collides
//! on a unique key becomes an update of the existing row, an update of a
//! missing row becomes an insert, and a delete of a missing row is
//! ignored. Each deviation is logged as a warning; the strict policy turns
//! them into hard failures instead.

pub mod applier;
pub mod fallback;

pub use applier::{Applier, ConflictPolicy};
pub use fallback::FallbackKeys;
