//! On-disk journal formats and readers for the shadowdb replica.
//!
//! A primary database publishes its change stream as a directory of
//! *segments*: append-only files carrying a fixed header followed by
//! variable-length *blocks*, each block holding the operation stream of a
//! single transaction boundary. This crate owns everything that touches
//! those bytes:
//!
//! - `segment`: the segment header format and lifecycle states
//! - `block`: the block header, the cursor-style [`BlockReader`], and the
//!   typed [`Operation`] stream decoded from it
//! - `control`: the per-source crash-safe checkpoint file
//! - `scanner`: directory enumeration into an ordered replay queue
//! - `testing`: segment/block builders used by tests across the workspace
//!
//! All multi-byte integers on the wire are little-endian.

pub mod block;
pub mod control;
pub mod scanner;
pub mod segment;
pub mod testing;

pub use block::{
    BlockHeader, BlockReader, Operation, BLOCK_BEGIN_TRANS, BLOCK_END_TRANS, BLOCK_HEADER_SIZE,
    META_NAME_SIZE,
};
pub use control::{
    oldest_sequence, ActiveTransaction, ControlFile, CONTROL_SIGNATURE, CONTROL_VERSION,
};
pub use scanner::{scan_directory, LogSegment};
pub use segment::{
    SegmentHeader, SegmentHeaderError, SegmentState, SEGMENT_FORMAT_VERSION, SEGMENT_HEADER_SIZE,
    SEGMENT_PROTOCOL_VERSION, SEGMENT_SIGNATURE,
};
