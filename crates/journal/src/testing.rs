//! Segment and block builders for tests.
//!
//! The producer side of the pipeline is out of scope, but every test that
//! exercises the reader, the applier, or the replay engine needs wire-exact
//! segments. The builders here emit the same layout the readers consume:
//! aligned little-endian values, an interned name table, and a 48-byte
//! segment header.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::block::{
    BlockHeader, BLOCK_HEADER_SIZE, META_NAME_SIZE, OP_CLEANUP_TRANSACTION, OP_COMMIT_TRANSACTION,
    OP_DELETE_RECORD, OP_EXECUTE_SQL, OP_INSERT_RECORD, OP_PREPARE_TRANSACTION,
    OP_RELEASE_SAVEPOINT, OP_ROLLBACK_SAVEPOINT, OP_ROLLBACK_TRANSACTION, OP_SET_SEQUENCE,
    OP_START_SAVEPOINT, OP_START_TRANSACTION, OP_STORE_BLOB, OP_UPDATE_RECORD,
};
use crate::segment::{SegmentHeader, SegmentState, SEGMENT_HEADER_SIZE};

/// Builds one block: a tagged operation stream plus its name table.
pub struct BlockBuilder {
    tra_number: u64,
    flags: u16,
    data: Vec<u8>,
    names: Vec<String>,
}

impl BlockBuilder {
    /// Start a block for the given master transaction and flags.
    pub fn new(tra_number: u64, flags: u16) -> Self {
        BlockBuilder {
            tra_number,
            flags,
            data: Vec::new(),
            names: Vec::new(),
        }
    }

    /// Append a StartTransaction operation.
    pub fn op_start_transaction(mut self) -> Self {
        self.data.push(OP_START_TRANSACTION);
        self
    }

    /// Append a PrepareTransaction operation.
    pub fn op_prepare_transaction(mut self) -> Self {
        self.data.push(OP_PREPARE_TRANSACTION);
        self
    }

    /// Append a CommitTransaction operation.
    pub fn op_commit_transaction(mut self) -> Self {
        self.data.push(OP_COMMIT_TRANSACTION);
        self
    }

    /// Append a RollbackTransaction operation.
    pub fn op_rollback_transaction(mut self) -> Self {
        self.data.push(OP_ROLLBACK_TRANSACTION);
        self
    }

    /// Append a CleanupTransaction operation.
    pub fn op_cleanup_transaction(mut self) -> Self {
        self.data.push(OP_CLEANUP_TRANSACTION);
        self
    }

    /// Append a StartSavepoint operation.
    pub fn op_start_savepoint(mut self) -> Self {
        self.data.push(OP_START_SAVEPOINT);
        self
    }

    /// Append a ReleaseSavepoint operation.
    pub fn op_release_savepoint(mut self) -> Self {
        self.data.push(OP_RELEASE_SAVEPOINT);
        self
    }

    /// Append a RollbackSavepoint operation.
    pub fn op_rollback_savepoint(mut self) -> Self {
        self.data.push(OP_ROLLBACK_SAVEPOINT);
        self
    }

    /// Append an InsertRecord operation.
    pub fn op_insert_record(mut self, relation: &str, image: &[u8]) -> Self {
        self.data.push(OP_INSERT_RECORD);
        self.push_name(relation);
        self.push_binary(image);
        self
    }

    /// Append an UpdateRecord operation.
    pub fn op_update_record(mut self, relation: &str, old_image: &[u8], new_image: &[u8]) -> Self {
        self.data.push(OP_UPDATE_RECORD);
        self.push_name(relation);
        self.push_binary(old_image);
        self.push_binary(new_image);
        self
    }

    /// Append a DeleteRecord operation.
    pub fn op_delete_record(mut self, relation: &str, image: &[u8]) -> Self {
        self.data.push(OP_DELETE_RECORD);
        self.push_name(relation);
        self.push_binary(image);
        self
    }

    /// Append a StoreBlob operation.
    pub fn op_store_blob(mut self, blob_id: u64, data: &[u8]) -> Self {
        self.data.push(OP_STORE_BLOB);
        self.push_int((blob_id >> 32) as i32);
        self.push_int(blob_id as u32 as i32);
        self.push_binary(data);
        self
    }

    /// Append an ExecuteSql operation.
    pub fn op_execute_sql(mut self, sql: &str, owner: &str) -> Self {
        self.data.push(OP_EXECUTE_SQL);
        self.push_binary(sql.as_bytes());
        self.push_name(owner);
        self
    }

    /// Append a SetSequence operation.
    pub fn op_set_sequence(mut self, name: &str, value: i64) -> Self {
        self.data.push(OP_SET_SEQUENCE);
        self.push_name(name);
        self.push_bigint(value);
        self
    }

    /// Serialize the block: header + data + interned name table.
    pub fn build(self) -> Vec<u8> {
        let mut metadata = Vec::with_capacity(self.names.len() * META_NAME_SIZE);
        for name in &self.names {
            let mut entry = [0u8; META_NAME_SIZE];
            let bytes = name.as_bytes();
            assert!(bytes.len() < META_NAME_SIZE, "name too long: {name}");
            entry[..bytes.len()].copy_from_slice(bytes);
            metadata.extend_from_slice(&entry);
        }

        let header = BlockHeader {
            tra_number: self.tra_number,
            flags: self.flags,
            data_length: self.data.len() as u32,
            meta_length: metadata.len() as u32,
        };

        let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE + self.data.len() + metadata.len());
        block.extend_from_slice(&header.to_bytes());
        block.extend_from_slice(&self.data);
        block.extend_from_slice(&metadata);
        block
    }

    fn align(&mut self, alignment: usize) {
        while self.data.len() % alignment != 0 {
            self.data.push(0);
        }
    }

    fn push_int(&mut self, value: i32) {
        self.align(4);
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn push_bigint(&mut self, value: i64) {
        self.align(8);
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn push_name(&mut self, name: &str) {
        let index = match self.names.iter().position(|n| n == name) {
            Some(index) => index,
            None => {
                self.names.push(name.to_owned());
                self.names.len() - 1
            }
        };
        self.push_int(index as i32);
    }

    fn push_binary(&mut self, bytes: &[u8]) {
        self.push_int(bytes.len() as i32);
        self.data.extend_from_slice(bytes);
    }
}

/// Builds one segment file from a list of blocks.
pub struct SegmentBuilder {
    guid: Uuid,
    sequence: u64,
    state: SegmentState,
    blocks: Vec<Vec<u8>>,
}

impl SegmentBuilder {
    /// Start a segment for the given source GUID and sequence number.
    ///
    /// The state defaults to ARCH, the form the producer hands off.
    pub fn new(guid: Uuid, sequence: u64) -> Self {
        SegmentBuilder {
            guid,
            sequence,
            state: SegmentState::Arch,
            blocks: Vec::new(),
        }
    }

    /// Override the lifecycle state in the header.
    pub fn state(mut self, state: SegmentState) -> Self {
        self.state = state;
        self
    }

    /// Append a finished block.
    pub fn block(mut self, block: Vec<u8>) -> Self {
        self.blocks.push(block);
        self
    }

    /// Serialize the whole segment.
    pub fn build(&self) -> Vec<u8> {
        let body_len: usize = self.blocks.iter().map(Vec::len).sum();
        let total = SEGMENT_HEADER_SIZE + body_len;

        let header = SegmentHeader::new(self.guid, self.sequence, self.state, total as u32);

        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&header.to_bytes());
        for block in &self.blocks {
            bytes.extend_from_slice(block);
        }
        bytes
    }

    /// Write the segment into `dir` under the producer's naming scheme.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(format!("archive.journal.{:06}", self.sequence));
        let mut file = fs::File::create(&path)?;
        file.write_all(&self.build())?;
        file.sync_all()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_BEGIN_TRANS;

    #[test]
    fn segment_total_length_covers_header_and_blocks() {
        let block = BlockBuilder::new(1, BLOCK_BEGIN_TRANS)
            .op_start_transaction()
            .build();
        let block_len = block.len();

        let segment = SegmentBuilder::new(Uuid::new_v4(), 5).block(block).build();

        let header = SegmentHeader::from_bytes(&segment).unwrap();
        assert_eq!(header.sequence, 5);
        assert_eq!(header.total_length as usize, segment.len());
        assert_eq!(segment.len(), SEGMENT_HEADER_SIZE + block_len);
    }

    #[test]
    fn written_segment_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let guid = Uuid::new_v4();

        let path = SegmentBuilder::new(guid, 9)
            .block(BlockBuilder::new(3, 0).op_start_savepoint().build())
            .write_to(dir.path())
            .unwrap();

        let bytes = fs::read(&path).unwrap();
        let header = SegmentHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.guid, guid);
        assert_eq!(header.sequence, 9);
        assert_eq!(header.state, SegmentState::Arch);
    }
}
