//! Local database seam for the shadowdb replica.
//!
//! The applier never touches storage internals: it drives everything
//! through the [`ReplicaDatabase`] trait, the ~15-operation surface a real
//! storage engine exposes (transactions, savepoints, the row-format
//! catalog, row and index operations, blobs, generators, immediate SQL).
//!
//! - `value`: the semantic value cell used for NULL-aware key comparison
//! - `format`: versioned row formats with fixed field offsets
//! - `engine`: the trait plus its metadata types
//! - `memory`: an in-memory engine backing the test suites
//!
//! The in-memory engine exists to exercise the seam; it is not a storage
//! engine.

pub mod engine;
pub mod format;
pub mod memory;
pub mod value;

pub use engine::{
    IndexInfo, RecordNumber, RelationId, RelationInfo, ReplicaDatabase, SqlDialect, TxId,
};
pub use format::{FieldDescriptor, FieldKind, RowFormat};
pub use memory::{ExecutedSql, MemoryEngine};
pub use value::Value;
