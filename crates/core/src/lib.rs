//! Shared types for the shadowdb replica.
//!
//! This crate holds the unified error type and the handful of identifiers
//! that every other crate speaks: master transaction numbers, segment
//! sequence numbers, and the source database GUID.

pub mod error;

pub use error::{Result, ShadowError};

/// Master-side transaction number as carried in block headers.
///
/// Zero means "no transaction" (non-transactional blocks such as DDL
/// boundaries).
pub type TxnId = u64;

/// Monotonically increasing journal segment sequence number.
pub type Sequence = u64;

/// Identifier of the originating database instance, embedded in every
/// segment header.
pub type SourceGuid = uuid::Uuid;
