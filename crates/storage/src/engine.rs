//! The `ReplicaDatabase` trait: everything the applier asks of the local
//! storage engine.
//!
//! All operations are atomic primitives from the applier's point of view;
//! their internal durability is the engine's business. The replay
//! position itself is never stored here; the control file owns it.

use std::sync::Arc;

use shadow_core::Result;

use crate::format::RowFormat;
use crate::value::Value;

/// Local transaction handle issued by the engine.
pub type TxId = u64;

/// Engine-assigned row identity within a relation.
pub type RecordNumber = u64;

/// Engine-assigned relation identity.
pub type RelationId = u32;

/// A relation as seen through the metadata catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    /// Engine-assigned id.
    pub id: RelationId,
    /// Relation name.
    pub name: String,
    /// True for the single-row database-info relation whose only record
    /// is always number 0.
    pub single_row: bool,
}

/// A key-capable index over a relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Index ordinal within the relation.
    pub id: usize,
    /// Field positions making up the key, in key order.
    pub fields: Vec<usize>,
    /// True when the index enforces uniqueness.
    pub unique: bool,
    /// True for the primary key.
    pub primary: bool,
}

/// SQL dialect for immediate statement execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// Legacy dialect.
    V5,
    /// Current dialect.
    V6,
}

/// The local database attachment consumed by the applier.
///
/// Implementations must be `Send`: each worker owns its attachment and
/// carries it across sweeps on its own thread.
pub trait ReplicaDatabase: Send {
    // ------------------------------------------------------------------
    // Attachment-level state
    // ------------------------------------------------------------------

    /// True when the database is configured as a replica.
    fn is_replica(&self) -> bool;

    /// True when the attachment is read-only.
    fn is_read_only(&self) -> bool;

    /// True when the attachment may replicate into the database.
    fn has_replicate_privilege(&self) -> bool;

    /// True when the database still speaks the legacy SQL dialect.
    fn legacy_dialect(&self) -> bool;

    /// The master database sequence the replica reports at connect time.
    fn replication_sequence(&self) -> Result<u64>;

    // ------------------------------------------------------------------
    // Transactions and savepoints
    // ------------------------------------------------------------------

    /// Open a local transaction in read-committed, record-version,
    /// no-auto-undo mode with wait level 1, the only mode replication
    /// uses.
    fn start_transaction(&mut self) -> Result<TxId>;

    /// First phase of two-phase commit.
    fn prepare(&mut self, tx: TxId) -> Result<()>;

    /// Commit and release the transaction.
    fn commit(&mut self, tx: TxId) -> Result<()>;

    /// Roll back and release the transaction.
    fn rollback(&mut self, tx: TxId) -> Result<()>;

    /// Open a nested savepoint.
    fn start_savepoint(&mut self, tx: TxId) -> Result<()>;

    /// Roll the innermost savepoint forward into its parent.
    fn release_savepoint(&mut self, tx: TxId) -> Result<()>;

    /// Undo the innermost savepoint.
    fn rollback_savepoint(&mut self, tx: TxId) -> Result<()>;

    /// True when the transaction has at least one open savepoint.
    fn has_savepoint(&self, tx: TxId) -> Result<bool>;

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Look up a relation by name.
    fn lookup_relation(&self, name: &str) -> Option<RelationInfo>;

    /// Key-capable indexes of a relation.
    fn relation_indexes(&self, relation: RelationId) -> Result<Vec<IndexInfo>>;

    /// The relation's current row format.
    fn current_format(&self, relation: RelationId) -> Result<Arc<RowFormat>>;

    /// A historical row format by version.
    fn format(&self, relation: RelationId, version: u16) -> Result<Arc<RowFormat>>;

    /// Relation-level lock hint ahead of row operations.
    fn reserve_relation(&mut self, tx: TxId, relation: RelationId, writable: bool) -> Result<()>;

    // ------------------------------------------------------------------
    // Rows and indexes
    // ------------------------------------------------------------------

    /// Store a new row (data and index updates together). Raises the
    /// engine's uniqueness violation when a unique key collides.
    fn store(
        &mut self,
        tx: TxId,
        relation: RelationId,
        format: u16,
        image: &[u8],
    ) -> Result<RecordNumber>;

    /// Replace an existing row with a new image.
    fn modify(
        &mut self,
        tx: TxId,
        relation: RelationId,
        record: RecordNumber,
        format: u16,
        image: &[u8],
    ) -> Result<()>;

    /// Erase an existing row.
    fn erase(&mut self, tx: TxId, relation: RelationId, record: RecordNumber) -> Result<()>;

    /// Fetch a row visible to the transaction: its format version and
    /// image, or `None` when the record does not exist.
    fn fetch(
        &self,
        tx: TxId,
        relation: RelationId,
        record: RecordNumber,
    ) -> Result<Option<(u16, Vec<u8>)>>;

    /// Sequential scan: the next visible record after `previous`
    /// (`None` starts from the beginning).
    fn next_record(
        &self,
        tx: TxId,
        relation: RelationId,
        previous: Option<RecordNumber>,
    ) -> Result<Option<RecordNumber>>;

    /// Equality range scan of an index: all records whose key cells match
    /// `key`. NULL key cells match NULL cells.
    fn index_lookup(
        &self,
        tx: TxId,
        relation: RelationId,
        index: usize,
        key: &[Option<Value>],
    ) -> Result<Vec<RecordNumber>>;

    // ------------------------------------------------------------------
    // Downstream replication hooks (chained replication)
    // ------------------------------------------------------------------

    /// Cascade a stored row to downstream replication, if chained.
    fn repl_store(&mut self, _tx: TxId, _relation: RelationId, _image: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Cascade a modified row to downstream replication, if chained.
    fn repl_modify(
        &mut self,
        _tx: TxId,
        _relation: RelationId,
        _old_image: &[u8],
        _new_image: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    /// Cascade an erased row to downstream replication, if chained.
    fn repl_erase(&mut self, _tx: TxId, _relation: RelationId, _image: &[u8]) -> Result<()> {
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Allocate a new temporary blob within the transaction.
    fn create_blob(&mut self, tx: TxId) -> Result<u64>;

    /// Append bytes to an open temporary blob.
    fn blob_put(&mut self, tx: TxId, blob: u64, data: &[u8]) -> Result<()>;

    /// Close a temporary blob; no more writes are accepted.
    fn blob_close(&mut self, tx: TxId, blob: u64) -> Result<()>;

    /// Materialize a closed temporary blob under a relation, assigning a
    /// permanent local id and the given subtype/charset tags.
    fn materialize_blob(
        &mut self,
        tx: TxId,
        blob: u64,
        relation: RelationId,
        sub_type: u8,
        charset: u8,
    ) -> Result<u64>;

    /// Read back a committed, materialized blob's content.
    fn read_blob(&self, blob: u64) -> Result<Vec<u8>>;

    // ------------------------------------------------------------------
    // Generators
    // ------------------------------------------------------------------

    /// Current value of a sequence generator, or `None` if it does not
    /// exist.
    fn generator_value(&self, name: &str) -> Result<Option<i64>>;

    /// Set a sequence generator. Generators are non-transactional.
    fn set_generator(&mut self, name: &str, value: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Immediate SQL
    // ------------------------------------------------------------------

    /// Execute a statement verbatim within the transaction, as `owner`,
    /// in the given dialect.
    fn execute_immediate(
        &mut self,
        tx: TxId,
        sql: &str,
        dialect: SqlDialect,
        owner: &str,
    ) -> Result<()>;
}
