//! Block format and the typed operation stream.
//!
//! # Block Layout
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬───────────────────────────┐
//! │ Header (24)      │ Data (dataLength)    │ Metadata (metaLength)     │
//! └──────────────────┴──────────────────────┴───────────────────────────┘
//!
//! Header:
//! traNumber(8) + flags(2) + pad(2) + dataLength(4) + metaLength(4) + pad(4)
//! ```
//!
//! The data section is a stream of tagged operations. The metadata section
//! is a random-access table of fixed-width interned name entries referenced
//! by `i32` index from the data section. Multi-byte integers inside the
//! data section are aligned to their natural alignment relative to the
//! start of the data section.

use shadow_core::{Result, ShadowError, TxnId};

/// Block flag: this block opens a master transaction.
pub const BLOCK_BEGIN_TRANS: u16 = 0x01;

/// Block flag: this block ends a master transaction.
pub const BLOCK_END_TRANS: u16 = 0x02;

/// Size of the block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 24;

/// Width of one interned name entry in the metadata section.
pub const META_NAME_SIZE: usize = 64;

// Operation tags in the data section.
pub(crate) const OP_START_TRANSACTION: u8 = 1;
pub(crate) const OP_PREPARE_TRANSACTION: u8 = 2;
pub(crate) const OP_COMMIT_TRANSACTION: u8 = 3;
pub(crate) const OP_ROLLBACK_TRANSACTION: u8 = 4;
pub(crate) const OP_CLEANUP_TRANSACTION: u8 = 5;
pub(crate) const OP_START_SAVEPOINT: u8 = 6;
pub(crate) const OP_RELEASE_SAVEPOINT: u8 = 7;
pub(crate) const OP_ROLLBACK_SAVEPOINT: u8 = 8;
pub(crate) const OP_INSERT_RECORD: u8 = 9;
pub(crate) const OP_UPDATE_RECORD: u8 = 10;
pub(crate) const OP_DELETE_RECORD: u8 = 11;
pub(crate) const OP_STORE_BLOB: u8 = 12;
pub(crate) const OP_EXECUTE_SQL: u8 = 13;
pub(crate) const OP_SET_SEQUENCE: u8 = 14;

/// Block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Master transaction number; zero for non-transactional blocks.
    pub tra_number: TxnId,

    /// Combination of `BLOCK_BEGIN_TRANS` / `BLOCK_END_TRANS`.
    pub flags: u16,

    /// Byte length of the data section.
    pub data_length: u32,

    /// Byte length of the metadata section.
    pub meta_length: u32,
}

impl BlockHeader {
    /// Serialize the header to its fixed on-wire form.
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.tra_number.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.flags.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.data_length.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.meta_length.to_le_bytes());
        bytes
    }

    /// Deserialize a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(ShadowError::Format(format!(
                "block header too short: expected {BLOCK_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(BlockHeader {
            tra_number: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            flags: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
            data_length: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            meta_length: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        })
    }

    /// Total on-wire length of the block including this header.
    pub fn total_length(&self) -> usize {
        BLOCK_HEADER_SIZE + self.data_length as usize + self.meta_length as usize
    }
}

/// One decoded replication operation, borrowing from the block buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation<'a> {
    /// Open the block's master transaction on the replica.
    StartTransaction,
    /// Prepare the transaction (two-phase commit).
    PrepareTransaction,
    /// Commit the transaction.
    CommitTransaction,
    /// Roll the transaction back.
    RollbackTransaction,
    /// Roll back after a crash; tolerated when the transaction is absent.
    CleanupTransaction,
    /// Open a nested savepoint.
    StartSavepoint,
    /// Release (roll forward) the innermost savepoint.
    ReleaseSavepoint,
    /// Undo the innermost savepoint.
    RollbackSavepoint,
    /// Insert a row image into a table.
    InsertRecord {
        /// Target table name.
        relation: &'a str,
        /// Encoded row image.
        image: &'a [u8],
    },
    /// Update a row identified by its old image to a new image.
    UpdateRecord {
        /// Target table name.
        relation: &'a str,
        /// Row image identifying the row to change.
        old_image: &'a [u8],
        /// Replacement row image.
        new_image: &'a [u8],
    },
    /// Delete a row identified by its image.
    DeleteRecord {
        /// Target table name.
        relation: &'a str,
        /// Row image identifying the row to erase.
        image: &'a [u8],
    },
    /// Stage blob content ahead of the row that references it.
    StoreBlob {
        /// Master-side blob id.
        blob_id: u64,
        /// Raw blob bytes.
        data: &'a [u8],
    },
    /// Execute a statement verbatim as the given owner.
    ExecuteSql {
        /// Statement text.
        sql: &'a str,
        /// Owner to execute as.
        owner: &'a str,
    },
    /// Advance a sequence generator; never moves it backward.
    SetSequence {
        /// Generator name.
        name: &'a str,
        /// Master-side value.
        value: i64,
    },
}

/// Cursor over one block's data section.
///
/// The reader is positioned at the start of the data section and consumes
/// typed values; the metadata section is addressed randomly through
/// [`BlockReader::meta_name`]. Reading past either boundary is a format
/// error that terminates segment processing.
pub struct BlockReader<'a> {
    header: BlockHeader,
    data: &'a [u8],
    metadata: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    /// Wrap a complete block buffer (header + data + metadata).
    pub fn new(block: &'a [u8]) -> Result<Self> {
        let header = BlockHeader::from_bytes(block)?;

        if block.len() != header.total_length() {
            return Err(ShadowError::Format(format!(
                "block length mismatch: header says {} bytes, buffer has {}",
                header.total_length(),
                block.len()
            )));
        }

        let data_end = BLOCK_HEADER_SIZE + header.data_length as usize;

        Ok(BlockReader {
            header,
            data: &block[BLOCK_HEADER_SIZE..data_end],
            metadata: &block[data_end..],
            pos: 0,
        })
    }

    /// The master transaction number from the block header.
    pub fn transaction_id(&self) -> TxnId {
        self.header.tra_number
    }

    /// The block flags from the header.
    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    /// True once the data cursor has reached the metadata boundary.
    pub fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Consume one tag byte.
    pub fn tag(&mut self) -> Result<u8> {
        let bytes = self.take(1)?;
        Ok(bytes[0])
    }

    /// Consume an aligned little-endian `i32`.
    pub fn int(&mut self) -> Result<i32> {
        self.align(4);
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Consume an aligned little-endian `i64`.
    pub fn bigint(&mut self) -> Result<i64> {
        self.align(8);
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Consume an `i32` index and resolve it against the interned name table.
    pub fn meta_name(&mut self) -> Result<&'a str> {
        let index = self.int()?;
        if index < 0 {
            return Err(ShadowError::Format(format!(
                "negative metadata name index: {index}"
            )));
        }

        let offset = index as usize * META_NAME_SIZE;
        let end = offset + META_NAME_SIZE;
        if end > self.metadata.len() {
            return Err(ShadowError::Format(format!(
                "metadata name index {index} out of bounds ({} bytes of metadata)",
                self.metadata.len()
            )));
        }

        let entry = &self.metadata[offset..end];
        let len = entry.iter().position(|&b| b == 0).unwrap_or(META_NAME_SIZE);
        std::str::from_utf8(&entry[..len])
            .map_err(|_| ShadowError::Format(format!("metadata name {index} is not valid UTF-8")))
    }

    /// Consume a length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<&'a str> {
        let bytes = self.binary()?;
        std::str::from_utf8(bytes)
            .map_err(|_| ShadowError::Format("string payload is not valid UTF-8".into()))
    }

    /// Consume a length-prefixed byte run without copying.
    pub fn binary(&mut self) -> Result<&'a [u8]> {
        let length = self.int()?;
        if length < 0 {
            return Err(ShadowError::Format(format!(
                "negative payload length: {length}"
            )));
        }
        self.take(length as usize)
    }

    /// Decode the next operation, or `None` at the end of the data section.
    pub fn next_operation(&mut self) -> Result<Option<Operation<'a>>> {
        if self.eof() {
            return Ok(None);
        }

        let op = match self.tag()? {
            OP_START_TRANSACTION => Operation::StartTransaction,
            OP_PREPARE_TRANSACTION => Operation::PrepareTransaction,
            OP_COMMIT_TRANSACTION => Operation::CommitTransaction,
            OP_ROLLBACK_TRANSACTION => Operation::RollbackTransaction,
            OP_CLEANUP_TRANSACTION => Operation::CleanupTransaction,
            OP_START_SAVEPOINT => Operation::StartSavepoint,
            OP_RELEASE_SAVEPOINT => Operation::ReleaseSavepoint,
            OP_ROLLBACK_SAVEPOINT => Operation::RollbackSavepoint,
            OP_INSERT_RECORD => Operation::InsertRecord {
                relation: self.meta_name()?,
                image: self.binary()?,
            },
            OP_UPDATE_RECORD => Operation::UpdateRecord {
                relation: self.meta_name()?,
                old_image: self.binary()?,
                new_image: self.binary()?,
            },
            OP_DELETE_RECORD => Operation::DeleteRecord {
                relation: self.meta_name()?,
                image: self.binary()?,
            },
            OP_STORE_BLOB => {
                let high = self.int()? as u32;
                let low = self.int()? as u32;
                Operation::StoreBlob {
                    blob_id: (u64::from(high) << 32) | u64::from(low),
                    data: self.binary()?,
                }
            }
            OP_EXECUTE_SQL => Operation::ExecuteSql {
                sql: self.string()?,
                owner: self.meta_name()?,
            },
            OP_SET_SEQUENCE => Operation::SetSequence {
                name: self.meta_name()?,
                value: self.bigint()?,
            },
            unknown => {
                return Err(ShadowError::Format(format!(
                    "unknown operation tag: {unknown}"
                )))
            }
        };

        Ok(Some(op))
    }

    fn align(&mut self, alignment: usize) {
        self.pos = (self.pos + alignment - 1) & !(alignment - 1);
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(length).ok_or_else(|| {
            ShadowError::Format("operation payload length overflows the data section".into())
        })?;
        if end > self.data.len() {
            return Err(ShadowError::Format(format!(
                "read of {length} bytes at offset {} crosses the metadata boundary",
                self.pos
            )));
        }

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::BlockBuilder;

    #[test]
    fn header_roundtrip() {
        let header = BlockHeader {
            tra_number: 77,
            flags: BLOCK_BEGIN_TRANS | BLOCK_END_TRANS,
            data_length: 120,
            meta_length: 64,
        };

        let decoded = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.total_length(), BLOCK_HEADER_SIZE + 120 + 64);
    }

    #[test]
    fn decodes_transaction_boundary_ops() {
        let block = BlockBuilder::new(42, BLOCK_BEGIN_TRANS | BLOCK_END_TRANS)
            .op_start_transaction()
            .op_commit_transaction()
            .build();

        let mut reader = BlockReader::new(&block).unwrap();
        assert_eq!(reader.transaction_id(), 42);
        assert_eq!(reader.flags(), BLOCK_BEGIN_TRANS | BLOCK_END_TRANS);

        assert_eq!(
            reader.next_operation().unwrap(),
            Some(Operation::StartTransaction)
        );
        assert_eq!(
            reader.next_operation().unwrap(),
            Some(Operation::CommitTransaction)
        );
        assert_eq!(reader.next_operation().unwrap(), None);
        assert!(reader.eof());
    }

    #[test]
    fn decodes_record_ops_with_interned_names() {
        let image = vec![1u8, 2, 3, 4];
        let block = BlockBuilder::new(7, 0)
            .op_insert_record("ORDERS", &image)
            .op_delete_record("ORDERS", &image)
            .build();

        let mut reader = BlockReader::new(&block).unwrap();

        match reader.next_operation().unwrap() {
            Some(Operation::InsertRecord { relation, image: i }) => {
                assert_eq!(relation, "ORDERS");
                assert_eq!(i, &image[..]);
            }
            other => panic!("expected InsertRecord, got {other:?}"),
        }

        match reader.next_operation().unwrap() {
            Some(Operation::DeleteRecord { relation, .. }) => assert_eq!(relation, "ORDERS"),
            other => panic!("expected DeleteRecord, got {other:?}"),
        }
    }

    #[test]
    fn interns_repeated_names_once() {
        let image = vec![0u8; 8];
        let block = BlockBuilder::new(7, 0)
            .op_insert_record("T", &image)
            .op_insert_record("T", &image)
            .build();

        let header = BlockHeader::from_bytes(&block).unwrap();
        assert_eq!(header.meta_length as usize, META_NAME_SIZE);
    }

    #[test]
    fn decodes_blob_sql_and_sequence_ops() {
        let block = BlockBuilder::new(7, 0)
            .op_store_blob(0xAAAA_0000_BBBB, b"hello")
            .op_execute_sql("CREATE TABLE T (A INT)", "SYSDBA")
            .op_set_sequence("GEN_ORDERS", 9000)
            .build();

        let mut reader = BlockReader::new(&block).unwrap();

        assert_eq!(
            reader.next_operation().unwrap(),
            Some(Operation::StoreBlob {
                blob_id: 0xAAAA_0000_BBBB,
                data: b"hello",
            })
        );
        assert_eq!(
            reader.next_operation().unwrap(),
            Some(Operation::ExecuteSql {
                sql: "CREATE TABLE T (A INT)",
                owner: "SYSDBA",
            })
        );
        assert_eq!(
            reader.next_operation().unwrap(),
            Some(Operation::SetSequence {
                name: "GEN_ORDERS",
                value: 9000,
            })
        );
        assert_eq!(reader.next_operation().unwrap(), None);
    }

    #[test]
    fn rejects_reads_past_the_metadata_boundary() {
        // A lone insert tag with no payload behind it.
        let header = BlockHeader {
            tra_number: 1,
            flags: 0,
            data_length: 1,
            meta_length: 0,
        };
        let mut block = header.to_bytes().to_vec();
        block.push(OP_INSERT_RECORD);

        let mut reader = BlockReader::new(&block).unwrap();
        assert!(matches!(
            reader.next_operation(),
            Err(shadow_core::ShadowError::Format(_))
        ));
    }

    #[test]
    fn rejects_unknown_tag() {
        let header = BlockHeader {
            tra_number: 1,
            flags: 0,
            data_length: 1,
            meta_length: 0,
        };
        let mut block = header.to_bytes().to_vec();
        block.push(0xEE);

        let mut reader = BlockReader::new(&block).unwrap();
        assert!(matches!(
            reader.next_operation(),
            Err(shadow_core::ShadowError::Format(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let header = BlockHeader {
            tra_number: 1,
            flags: 0,
            data_length: 16,
            meta_length: 0,
        };
        let block = header.to_bytes().to_vec(); // missing the 16 data bytes
        assert!(matches!(
            BlockReader::new(&block),
            Err(shadow_core::ShadowError::Format(_))
        ));
    }
}
