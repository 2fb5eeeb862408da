//! Per-database stateful consumer of decoded block operations.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shadow_core::{Result, ShadowError, TxnId};
use shadow_journal::{BlockReader, Operation};
use shadow_storage::{
    FieldKind, RecordNumber, RelationInfo, ReplicaDatabase, RowFormat, SqlDialect, TxId, Value,
};
use tracing::{error, warn};

use crate::fallback::FallbackKeys;

/// What to do when the received image and the local row state diverge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Reconcile toward the received image and log a warning (default).
    #[default]
    Resolve,
    /// Fail the operation instead of deviating from the straight action.
    Strict,
}

/// A local transaction standing in for a master transaction.
struct ReplicaTxn {
    handle: TxId,
    /// Master blob id → local temporary blob id, for blobs stored ahead
    /// of the rows that reference them.
    blobs: HashMap<u64, u64>,
}

/// The applier: owns the replica-transaction map and drives all decoded
/// operations against one local attachment.
pub struct Applier {
    db: Box<dyn ReplicaDatabase>,
    txns: HashMap<TxnId, ReplicaTxn>,
    /// Scratch candidate list reused across record identifications.
    candidates: Vec<RecordNumber>,
    fallback: FallbackKeys,
    policy: ConflictPolicy,
}

impl Applier {
    /// Create an applier over an attachment.
    ///
    /// Fails fatally unless the database is in replica mode and the
    /// attachment holds the privilege to replicate into it.
    pub fn new(
        db: Box<dyn ReplicaDatabase>,
        fallback: FallbackKeys,
        policy: ConflictPolicy,
    ) -> Result<Self> {
        if !db.is_replica() {
            return Err(ShadowError::NotReplica);
        }
        if !db.has_replicate_privilege() {
            return Err(ShadowError::MissingPrivilege);
        }

        Ok(Applier {
            db,
            txns: HashMap::new(),
            candidates: Vec::new(),
            fallback,
            policy,
        })
    }

    /// True while any replica transaction is still open.
    ///
    /// Open transactions must survive across sweeps; the replay engine
    /// uses this to decide how to bootstrap its next expected sequence.
    pub fn has_open_transactions(&self) -> bool {
        !self.txns.is_empty()
    }

    /// Roll back every open replica transaction and clear internal state.
    pub fn shutdown(&mut self) {
        for (tra, txn) in self.txns.drain() {
            if let Err(e) = self.db.rollback(txn.handle) {
                error!(
                    target: "shadow::apply",
                    txn = tra,
                    error = %e,
                    "rollback on applier shutdown failed"
                );
            }
        }
        self.candidates.clear();
    }

    /// Apply one complete block.
    ///
    /// Errors are surfaced with the replication context wrapper and
    /// logged here, so the caller can suppress duplicate reporting.
    pub fn process(&mut self, block: &[u8]) -> Result<()> {
        if self.db.is_read_only() {
            return Err(ShadowError::replication(ShadowError::ReadOnly));
        }

        self.process_inner(block).map_err(|e| {
            let wrapped = ShadowError::replication(e);
            error!(target: "shadow::apply", error = %wrapped, "block application failed");
            wrapped
        })
    }

    fn process_inner(&mut self, block: &[u8]) -> Result<()> {
        let mut reader = BlockReader::new(block)?;
        let tra = reader.transaction_id();

        while let Some(op) = reader.next_operation()? {
            match op {
                Operation::StartTransaction => self.start_transaction(tra)?,
                Operation::PrepareTransaction => self.prepare_transaction(tra)?,
                Operation::CommitTransaction => self.commit_transaction(tra)?,
                Operation::RollbackTransaction => self.rollback_transaction(tra, false)?,
                Operation::CleanupTransaction => self.rollback_transaction(tra, true)?,
                Operation::StartSavepoint => self.start_savepoint(tra)?,
                Operation::ReleaseSavepoint => self.cleanup_savepoint(tra, false)?,
                Operation::RollbackSavepoint => self.cleanup_savepoint(tra, true)?,
                Operation::InsertRecord { relation, image } => {
                    self.insert_record(tra, relation, image)?
                }
                Operation::UpdateRecord {
                    relation,
                    old_image,
                    new_image,
                } => self.update_record(tra, relation, old_image, new_image)?,
                Operation::DeleteRecord { relation, image } => {
                    self.delete_record(tra, relation, image)?
                }
                Operation::StoreBlob { blob_id, data } => self.store_blob(tra, blob_id, data)?,
                Operation::ExecuteSql { sql, owner } => self.execute_sql(tra, sql, owner)?,
                Operation::SetSequence { name, value } => self.set_sequence(name, value)?,
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Transaction boundaries
    // ------------------------------------------------------------------

    fn handle(&self, tra: TxnId) -> Result<TxId> {
        self.txns
            .get(&tra)
            .map(|t| t.handle)
            .ok_or(ShadowError::TxnNotFound { txn: tra })
    }

    fn start_transaction(&mut self, tra: TxnId) -> Result<()> {
        if self.txns.contains_key(&tra) {
            return Err(ShadowError::TxnExists { txn: tra });
        }

        let handle = self.db.start_transaction()?;
        self.txns.insert(
            tra,
            ReplicaTxn {
                handle,
                blobs: HashMap::new(),
            },
        );
        Ok(())
    }

    fn prepare_transaction(&mut self, tra: TxnId) -> Result<()> {
        let handle = self.handle(tra)?;
        self.db.prepare(handle)
    }

    fn commit_transaction(&mut self, tra: TxnId) -> Result<()> {
        let handle = self.handle(tra)?;
        self.db.commit(handle)?;
        self.txns.remove(&tra);
        Ok(())
    }

    fn rollback_transaction(&mut self, tra: TxnId, cleanup: bool) -> Result<()> {
        let handle = match self.txns.get(&tra) {
            Some(txn) => txn.handle,
            // Cleanup after a crash mid-shutdown is idempotent.
            None if cleanup => return Ok(()),
            None => return Err(ShadowError::TxnNotFound { txn: tra }),
        };

        self.db.rollback(handle)?;
        self.txns.remove(&tra);
        Ok(())
    }

    fn start_savepoint(&mut self, tra: TxnId) -> Result<()> {
        let handle = self.handle(tra)?;
        self.db.start_savepoint(handle)
    }

    fn cleanup_savepoint(&mut self, tra: TxnId, undo: bool) -> Result<()> {
        let handle = self.handle(tra)?;

        if !self.db.has_savepoint(handle)? {
            return Err(ShadowError::NoSavepoint { txn: tra });
        }

        if undo {
            self.db.rollback_savepoint(handle)
        } else {
            self.db.release_savepoint(handle)
        }
    }

    // ------------------------------------------------------------------
    // Sequences, blobs, SQL
    // ------------------------------------------------------------------

    fn set_sequence(&mut self, name: &str, value: i64) -> Result<()> {
        let current = self
            .db
            .generator_value(name)?
            .ok_or_else(|| ShadowError::GeneratorNotFound {
                name: name.to_owned(),
            })?;

        // The ratchet only moves forward.
        if current < value {
            self.db.set_generator(name, value)?;
        }
        Ok(())
    }

    fn store_blob(&mut self, tra: TxnId, blob_id: u64, data: &[u8]) -> Result<()> {
        let handle = self.handle(tra)?;

        let temp = self.db.create_blob(handle)?;
        self.db.blob_put(handle, temp, data)?;
        self.db.blob_close(handle, temp)?;

        self.txns
            .get_mut(&tra)
            .ok_or(ShadowError::TxnNotFound { txn: tra })?
            .blobs
            .insert(blob_id, temp);
        Ok(())
    }

    fn execute_sql(&mut self, tra: TxnId, sql: &str, owner: &str) -> Result<()> {
        let handle = self.handle(tra)?;
        let dialect = if self.db.legacy_dialect() {
            SqlDialect::V5
        } else {
            SqlDialect::V6
        };
        self.db.execute_immediate(handle, sql, dialect, owner)
    }

    // ------------------------------------------------------------------
    // Record operations
    // ------------------------------------------------------------------

    fn insert_record(&mut self, tra: TxnId, relation: &str, image: &[u8]) -> Result<()> {
        let handle = self.handle(tra)?;
        let rel = self.lookup_relation(relation)?;
        let format = self.find_format(&rel, image.len())?;

        let resolved = self.resolve_insert_blobs(tra, &rel, &format, image.to_vec())?;

        match self.do_insert(handle, &rel, &format, &resolved) {
            Ok(()) => return Ok(()),
            // Uniqueness violations are resolved below; everything else
            // propagates.
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }

        let found = if self.policy == ConflictPolicy::Resolve {
            self.identify(handle, &rel, &format, &resolved)?
        } else {
            None
        };

        if let Some((record, _, old_image)) = found {
            warn!(
                target: "shadow::apply",
                table = relation,
                "record being inserted into table {relation} already exists, updating instead"
            );
            self.db.reserve_relation(handle, rel.id, true)?;
            self.db
                .modify(handle, rel.id, record, format.version, &resolved)?;
            self.db.repl_modify(handle, rel.id, &old_image, &resolved)?;
            Ok(())
        } else {
            // Second (paranoid) attempt.
            self.do_insert(handle, &rel, &format, &resolved)
        }
    }

    fn update_record(
        &mut self,
        tra: TxnId,
        relation: &str,
        old_image: &[u8],
        new_image: &[u8],
    ) -> Result<()> {
        let handle = self.handle(tra)?;
        let rel = self.lookup_relation(relation)?;
        let org_format = self.find_format(&rel, old_image.len())?;
        let new_format = self.find_format(&rel, new_image.len())?;

        let found = self.identify(handle, &rel, &org_format, old_image)?;

        if let Some((record, row_format, row_image)) = found {
            let resolved = self.resolve_update_blobs(
                tra,
                &rel,
                &new_format,
                new_image.to_vec(),
                &org_format,
                old_image,
                &row_format,
                &row_image,
            )?;

            self.db.reserve_relation(handle, rel.id, true)?;
            self.db
                .modify(handle, rel.id, record, new_format.version, &resolved)?;
            self.db.repl_modify(handle, rel.id, &row_image, &resolved)?;
            Ok(())
        } else if self.policy == ConflictPolicy::Resolve {
            warn!(
                target: "shadow::apply",
                table = relation,
                "record being updated in table {relation} does not exist, inserting instead"
            );
            let resolved = self.resolve_insert_blobs(tra, &rel, &new_format, new_image.to_vec())?;
            self.do_insert(handle, &rel, &new_format, &resolved)
        } else {
            Err(ShadowError::ConflictRejected {
                relation: relation.to_owned(),
            })
        }
    }

    fn delete_record(&mut self, tra: TxnId, relation: &str, image: &[u8]) -> Result<()> {
        let handle = self.handle(tra)?;
        let rel = self.lookup_relation(relation)?;
        let format = self.find_format(&rel, image.len())?;

        let found = self.identify(handle, &rel, &format, image)?;

        if let Some((record, _, row_image)) = found {
            self.db.reserve_relation(handle, rel.id, true)?;
            self.db.erase(handle, rel.id, record)?;
            self.db.repl_erase(handle, rel.id, &row_image)?;
            Ok(())
        } else if self.policy == ConflictPolicy::Resolve {
            // Deletion is idempotent.
            warn!(
                target: "shadow::apply",
                table = relation,
                "record being deleted from table {relation} does not exist, ignoring"
            );
            Ok(())
        } else {
            Err(ShadowError::ConflictRejected {
                relation: relation.to_owned(),
            })
        }
    }

    fn do_insert(
        &mut self,
        handle: TxId,
        rel: &RelationInfo,
        format: &Arc<RowFormat>,
        image: &[u8],
    ) -> Result<()> {
        self.db.reserve_relation(handle, rel.id, true)?;
        self.db.store(handle, rel.id, format.version, image)?;
        self.db.repl_store(handle, rel.id, image)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blob materialization
    // ------------------------------------------------------------------

    /// Materialize every staged blob referenced by an image to be
    /// inserted, rewriting its blob cells to permanent local ids.
    fn resolve_insert_blobs(
        &mut self,
        tra: TxnId,
        rel: &RelationInfo,
        format: &Arc<RowFormat>,
        mut image: Vec<u8>,
    ) -> Result<Vec<u8>> {
        for index in 0..format.field_count() {
            let (sub_type, charset) = match format.fields[index].kind {
                FieldKind::Blob { sub_type, charset } => (sub_type, charset),
                _ => continue,
            };

            let master_id = match format.blob_reference(&image, index)? {
                Some(id) => id,
                None => continue,
            };

            let local = self.materialize(tra, rel, master_id, sub_type, charset)?;
            format.set_blob_reference(&mut image, index, local)?;
        }
        Ok(image)
    }

    /// Same as [`Self::resolve_insert_blobs`], plus the unchanged-blob
    /// rule: when the new image references the same master blob as the old
    /// image, the existing local row's blob id is inherited so unchanged
    /// blobs avoid retransmission.
    #[allow(clippy::too_many_arguments)]
    fn resolve_update_blobs(
        &mut self,
        tra: TxnId,
        rel: &RelationInfo,
        new_format: &Arc<RowFormat>,
        mut image: Vec<u8>,
        org_format: &Arc<RowFormat>,
        org_image: &[u8],
        row_format: &Arc<RowFormat>,
        row_image: &[u8],
    ) -> Result<Vec<u8>> {
        for index in 0..new_format.field_count() {
            let (sub_type, charset) = match new_format.fields[index].kind {
                FieldKind::Blob { sub_type, charset } => (sub_type, charset),
                _ => continue,
            };

            let master_id = match new_format.blob_reference(&image, index)? {
                Some(id) => id,
                None => continue,
            };

            let source_id = if index < org_format.field_count() {
                org_format.blob_reference(org_image, index)?
            } else {
                None
            };

            if source_id == Some(master_id) {
                // Unchanged blob: inherit the local id from the row being
                // replaced rather than expecting retransmitted content.
                let inherited = if index < row_format.field_count() {
                    row_format.blob_reference(row_image, index)?
                } else {
                    None
                };
                new_format.set_blob_reference(&mut image, index, inherited.unwrap_or(0))?;
            } else {
                let local = self.materialize(tra, rel, master_id, sub_type, charset)?;
                new_format.set_blob_reference(&mut image, index, local)?;
            }
        }
        Ok(image)
    }

    fn materialize(
        &mut self,
        tra: TxnId,
        rel: &RelationInfo,
        master_id: u64,
        sub_type: u8,
        charset: u8,
    ) -> Result<u64> {
        let handle = self.handle(tra)?;

        let temp = self
            .txns
            .get_mut(&tra)
            .ok_or(ShadowError::TxnNotFound { txn: tra })?
            .blobs
            .remove(&master_id)
            .ok_or(ShadowError::BlobNotFound {
                blob_id: master_id,
                relation: rel.name.clone(),
            })?;

        self.db
            .materialize_blob(handle, temp, rel.id, sub_type, charset)
    }

    // ------------------------------------------------------------------
    // Record identification
    // ------------------------------------------------------------------

    fn lookup_relation(&self, name: &str) -> Result<RelationInfo> {
        self.db
            .lookup_relation(name)
            .ok_or_else(|| ShadowError::RelationNotFound {
                relation: name.to_owned(),
            })
    }

    /// Locate the table's historical row format whose encoded length
    /// matches the wire image, walking back from the current version.
    fn find_format(&self, rel: &RelationInfo, length: usize) -> Result<Arc<RowFormat>> {
        let mut format = self.db.current_format(rel.id)?;

        while format.row_length() != length && format.version > 0 {
            format = self.db.format(rel.id, format.version - 1)?;
        }

        if format.row_length() != length {
            return Err(ShadowError::FormatNotFound {
                length: length as u32,
                relation: rel.name.clone(),
            });
        }

        Ok(format)
    }

    /// Pick the identification key: the primary key if present, otherwise
    /// the unique index with the fewest columns.
    fn lookup_key(&self, rel: &RelationInfo) -> Result<Option<shadow_storage::IndexInfo>> {
        let mut best: Option<shadow_storage::IndexInfo> = None;

        for index in self.db.relation_indexes(rel.id)? {
            if index.primary {
                return Ok(Some(index));
            }
            if index.unique {
                let better = match &best {
                    Some(current) => index.fields.len() < current.fields.len(),
                    None => true,
                };
                if better {
                    best = Some(index);
                }
            }
        }

        Ok(best)
    }

    /// Collect candidate records for an image into the scratch buffer.
    ///
    /// Returns the index used, or `None` when candidates came from the
    /// single-row relation shortcut or a fallback full scan.
    fn collect_candidates(
        &mut self,
        handle: TxId,
        rel: &RelationInfo,
        format: &Arc<RowFormat>,
        image: &[u8],
    ) -> Result<Option<shadow_storage::IndexInfo>> {
        self.candidates.clear();

        // The single-row database-info relation has no keys but is
        // guaranteed to hold exactly one record.
        if rel.single_row {
            self.candidates.push(0);
            return Ok(None);
        }

        if let Some(index) = self.lookup_key(rel)? {
            let key = self.key_values(format, image, &index.fields)?;
            let matches = self.db.index_lookup(handle, rel.id, index.id, &key)?;
            self.candidates.extend(matches);
            return Ok(Some(index));
        }

        let fields = self
            .fallback
            .fields(&rel.name)
            .map(|fields| fields.to_vec())
            .ok_or_else(|| ShadowError::NoUniqueKey {
                relation: rel.name.clone(),
            })?;

        self.db.reserve_relation(handle, rel.id, false)?;

        let image_values: Vec<Option<Value>> = fields
            .iter()
            .map(|name| self.named_field(format, image, name))
            .collect::<Result<_>>()?;

        let mut cursor = None;
        while let Some(record) = self.db.next_record(handle, rel.id, cursor)? {
            cursor = Some(record);

            let (version, row_image) = match self.db.fetch(handle, rel.id, record)? {
                Some(row) => row,
                None => continue,
            };
            let row_format = self.db.format(rel.id, version)?;

            let mut matched = true;
            for (name, image_value) in fields.iter().zip(&image_values) {
                let row_value = self.named_field(&row_format, &row_image, name)?;
                if !shadow_storage::value::semantically_equal(image_value, &row_value) {
                    matched = false;
                    break;
                }
            }

            if matched {
                self.candidates.push(record);
            }
        }

        Ok(None)
    }

    /// Identify the unique row matching an image: candidate collection
    /// plus a semantic key re-check, failing on ambiguity.
    fn identify(
        &mut self,
        handle: TxId,
        rel: &RelationInfo,
        format: &Arc<RowFormat>,
        image: &[u8],
    ) -> Result<Option<(RecordNumber, Arc<RowFormat>, Vec<u8>)>> {
        let index = self.collect_candidates(handle, rel, format, image)?;

        let mut found: Option<(RecordNumber, Arc<RowFormat>, Vec<u8>)> = None;

        for position in 0..self.candidates.len() {
            let record = self.candidates[position];

            let (version, row_image) = match self.db.fetch(handle, rel.id, record)? {
                Some(row) => row,
                None => continue,
            };
            let row_format = self.db.format(rel.id, version)?;

            let matches = match &index {
                Some(index) => {
                    self.compare_key(index, format, image, &row_format, &row_image)?
                }
                None => true,
            };

            if matches {
                if found.is_some() {
                    return Err(ShadowError::AmbiguousKey {
                        relation: rel.name.clone(),
                    });
                }
                found = Some((record, row_format, row_image));
            }
        }

        Ok(found)
    }

    /// NULL-aware semantic comparison of the key fields of two images.
    fn compare_key(
        &self,
        index: &shadow_storage::IndexInfo,
        format1: &Arc<RowFormat>,
        image1: &[u8],
        format2: &Arc<RowFormat>,
        image2: &[u8],
    ) -> Result<bool> {
        for &field in &index.fields {
            let a = self.field_or_null(format1, image1, field)?;
            let b = self.field_or_null(format2, image2, field)?;
            if !shadow_storage::value::semantically_equal(&a, &b) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn key_values(
        &self,
        format: &Arc<RowFormat>,
        image: &[u8],
        fields: &[usize],
    ) -> Result<Vec<Option<Value>>> {
        fields
            .iter()
            .map(|&field| self.field_or_null(format, image, field))
            .collect()
    }

    fn field_or_null(
        &self,
        format: &Arc<RowFormat>,
        image: &[u8],
        field: usize,
    ) -> Result<Option<Value>> {
        if field < format.field_count() {
            format.decode_field(image, field)
        } else {
            Ok(None)
        }
    }

    fn named_field(
        &self,
        format: &Arc<RowFormat>,
        image: &[u8],
        name: &str,
    ) -> Result<Option<Value>> {
        match format.fields.iter().position(|f| f.name == name) {
            Some(field) => format.decode_field(image, field),
            None => Ok(None),
        }
    }
}
