//! Journal segment header format.
//!
//! # Segment Layout
//!
//! ```text
//! ┌────────────────────────────────────┐
//! │ Segment Header (48 bytes)          │
//! ├────────────────────────────────────┤
//! │ Block 1                            │
//! ├────────────────────────────────────┤
//! │ Block 2                            │
//! ├────────────────────────────────────┤
//! │ ...                                │
//! └────────────────────────────────────┘
//! ```
//!
//! # Header Layout (48 bytes)
//!
//! ```text
//! signature("FBLOG\0", 6) + version(2) + protocol(2) + state(1) + pad(1)
//! + source_guid(16) + sequence(8) + total_length(4) + pad(8) = 48 bytes
//! ```
//!
//! The `total_length` covers the whole segment including the header.
//! Only segments in the FULL or ARCH state are eligible for replay.

use uuid::Uuid;

/// ASCII signature identifying a journal segment file.
pub const SEGMENT_SIGNATURE: [u8; 6] = *b"FBLOG\0";

/// Current segment format version.
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

/// Current replication protocol version.
pub const SEGMENT_PROTOCOL_VERSION: u16 = 1;

/// Size of the segment header in bytes.
pub const SEGMENT_HEADER_SIZE: usize = 48;

/// Lifecycle state of a segment on the producer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentState {
    /// Preallocated, never written. Stale if found in an archive directory.
    Free = 0,
    /// Currently being written by the producer.
    Used = 1,
    /// Completely written, not yet archived.
    Full = 2,
    /// Archived into the watched directory.
    Arch = 3,
}

impl SegmentState {
    /// Decode a state byte, rejecting unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SegmentState::Free),
            1 => Some(SegmentState::Used),
            2 => Some(SegmentState::Full),
            3 => Some(SegmentState::Arch),
            _ => None,
        }
    }

    /// True for the states a replica is allowed to replay.
    pub fn is_replayable(&self) -> bool {
        matches!(self, SegmentState::Full | SegmentState::Arch)
    }
}

/// Journal segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format version.
    pub version: u16,

    /// Replication protocol version.
    pub protocol: u16,

    /// Producer-side lifecycle state.
    pub state: SegmentState,

    /// GUID of the originating database instance.
    pub guid: Uuid,

    /// Monotonically increasing sequence number within the source.
    pub sequence: u64,

    /// Total byte length of the segment, header included.
    pub total_length: u32,
}

impl SegmentHeader {
    /// Create a header for a new segment.
    pub fn new(guid: Uuid, sequence: u64, state: SegmentState, total_length: u32) -> Self {
        SegmentHeader {
            version: SEGMENT_FORMAT_VERSION,
            protocol: SEGMENT_PROTOCOL_VERSION,
            state,
            guid,
            sequence,
            total_length,
        }
    }

    /// Serialize the header to its fixed on-disk form.
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut bytes = [0u8; SEGMENT_HEADER_SIZE];
        bytes[0..6].copy_from_slice(&SEGMENT_SIGNATURE);
        bytes[6..8].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.protocol.to_le_bytes());
        bytes[10] = self.state as u8;
        bytes[12..28].copy_from_slice(self.guid.as_bytes());
        bytes[28..36].copy_from_slice(&self.sequence.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.total_length.to_le_bytes());
        bytes
    }

    /// Deserialize and validate a header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentHeaderError> {
        if bytes.len() < SEGMENT_HEADER_SIZE {
            return Err(SegmentHeaderError::TooShort {
                expected: SEGMENT_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        if bytes[0..6] != SEGMENT_SIGNATURE {
            return Err(SegmentHeaderError::BadSignature);
        }

        let version = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
        if version != SEGMENT_FORMAT_VERSION {
            return Err(SegmentHeaderError::UnsupportedVersion(version));
        }

        let protocol = u16::from_le_bytes(bytes[8..10].try_into().unwrap());
        if protocol != SEGMENT_PROTOCOL_VERSION {
            return Err(SegmentHeaderError::UnsupportedProtocol(protocol));
        }

        let state =
            SegmentState::from_u8(bytes[10]).ok_or(SegmentHeaderError::InvalidState(bytes[10]))?;

        let guid = Uuid::from_bytes(bytes[12..28].try_into().unwrap());
        let sequence = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        let total_length = u32::from_le_bytes(bytes[36..40].try_into().unwrap());

        Ok(SegmentHeader {
            version,
            protocol,
            state,
            guid,
            sequence,
            total_length,
        })
    }
}

/// Errors raised while validating a segment header.
///
/// The scanner treats all of these as skip-and-continue conditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentHeaderError {
    /// File smaller than a segment header.
    #[error("segment header too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum required size.
        expected: usize,
        /// Observed size.
        actual: usize,
    },

    /// Signature bytes do not match.
    #[error("unknown segment signature")]
    BadSignature,

    /// Format version other than the one this replica understands.
    #[error("unsupported segment version: {0}")]
    UnsupportedVersion(u16),

    /// Protocol version other than the one this replica understands.
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocol(u16),

    /// State byte outside the known lifecycle values.
    #[error("invalid segment state: {0}")]
    InvalidState(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let guid = Uuid::new_v4();
        let header = SegmentHeader::new(guid, 42, SegmentState::Arch, 1024);

        let bytes = header.to_bytes();
        let decoded = SegmentHeader::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, header);
        assert_eq!(decoded.guid, guid);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.total_length, 1024);
    }

    #[test]
    fn rejects_bad_signature() {
        let mut bytes = SegmentHeader::new(Uuid::new_v4(), 1, SegmentState::Full, 48).to_bytes();
        bytes[0] = b'X';
        assert_eq!(
            SegmentHeader::from_bytes(&bytes),
            Err(SegmentHeaderError::BadSignature)
        );
    }

    #[test]
    fn rejects_unknown_version_and_state() {
        let header = SegmentHeader::new(Uuid::new_v4(), 1, SegmentState::Full, 48);

        let mut bytes = header.to_bytes();
        bytes[6..8].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(
            SegmentHeader::from_bytes(&bytes),
            Err(SegmentHeaderError::UnsupportedVersion(9))
        );

        let mut bytes = header.to_bytes();
        bytes[10] = 7;
        assert_eq!(
            SegmentHeader::from_bytes(&bytes),
            Err(SegmentHeaderError::InvalidState(7))
        );
    }

    #[test]
    fn rejects_short_input() {
        let bytes = [0u8; 10];
        assert!(matches!(
            SegmentHeader::from_bytes(&bytes),
            Err(SegmentHeaderError::TooShort { .. })
        ));
    }

    #[test]
    fn replayable_states() {
        assert!(!SegmentState::Free.is_replayable());
        assert!(!SegmentState::Used.is_replayable());
        assert!(SegmentState::Full.is_replayable());
        assert!(SegmentState::Arch.is_replayable());
    }
}
