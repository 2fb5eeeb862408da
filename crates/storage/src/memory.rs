//! In-memory engine behind the `ReplicaDatabase` seam.
//!
//! Backs the applier and replay-engine test suites with real transactional
//! visibility: committed base rows plus a per-transaction overlay with a
//! savepoint undo stack. Uniqueness is enforced at store/modify time so
//! the applier's conflict path sees the same error a real engine raises.
//!
//! The engine is a cloneable handle over shared state, so a test can keep
//! one clone for assertions while workers drive another.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use shadow_core::{Result, ShadowError};

use crate::engine::{
    IndexInfo, RecordNumber, RelationId, RelationInfo, ReplicaDatabase, SqlDialect, TxId,
};
use crate::format::{FieldDescriptor, RowFormat};
use crate::value::{semantically_equal, Value};

/// One statement recorded by `execute_immediate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedSql {
    /// Statement text, verbatim.
    pub sql: String,
    /// Owner the statement ran as.
    pub owner: String,
    /// Dialect it ran in.
    pub dialect: SqlDialect,
}

#[derive(Debug, Clone)]
struct StoredRow {
    format: u16,
    image: Vec<u8>,
}

struct Relation {
    info: RelationInfo,
    indexes: Vec<IndexInfo>,
    formats: Vec<Arc<RowFormat>>,
    rows: BTreeMap<RecordNumber, StoredRow>,
    next_record: RecordNumber,
}

#[derive(Debug, Clone)]
struct TempBlob {
    data: Vec<u8>,
    closed: bool,
}

#[derive(Default)]
struct Txn {
    prepared: bool,
    writes: HashMap<RelationId, BTreeMap<RecordNumber, Option<StoredRow>>>,
    savepoints: Vec<HashMap<(RelationId, RecordNumber), Option<Option<StoredRow>>>>,
    temp_blobs: HashMap<u64, TempBlob>,
    materialized: HashMap<u64, Vec<u8>>,
}

struct EngineState {
    replica_mode: bool,
    read_only: bool,
    privileged: bool,
    legacy_dialect: bool,
    replication_sequence: u64,
    relations: Vec<Relation>,
    names: HashMap<String, RelationId>,
    generators: HashMap<String, i64>,
    blobs: HashMap<u64, Vec<u8>>,
    executed: Vec<ExecutedSql>,
    txns: HashMap<TxId, Txn>,
    next_tx: TxId,
    next_blob: u64,
}

/// Cloneable in-memory engine handle.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Mutex<EngineState>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// A writable, privileged engine in replica mode.
    pub fn new() -> Self {
        MemoryEngine {
            inner: Arc::new(Mutex::new(EngineState {
                replica_mode: true,
                read_only: false,
                privileged: true,
                legacy_dialect: false,
                replication_sequence: 0,
                relations: Vec::new(),
                names: HashMap::new(),
                generators: HashMap::new(),
                blobs: HashMap::new(),
                executed: Vec::new(),
                txns: HashMap::new(),
                next_tx: 1,
                next_blob: 1,
            })),
        }
    }

    /// Register a relation; returns its id.
    pub fn define_relation(&self, name: &str, single_row: bool) -> RelationId {
        let mut state = self.inner.lock();
        let id = state.relations.len() as RelationId;
        state.relations.push(Relation {
            info: RelationInfo {
                id,
                name: name.to_owned(),
                single_row,
            },
            indexes: Vec::new(),
            formats: Vec::new(),
            rows: BTreeMap::new(),
            next_record: 0,
        });
        state.names.insert(name.to_owned(), id);
        id
    }

    /// Append a new row format version to a relation; returns the version.
    pub fn add_format(&self, relation: RelationId, fields: Vec<FieldDescriptor>) -> u16 {
        let mut state = self.inner.lock();
        let rel = &mut state.relations[relation as usize];
        let version = rel.formats.len() as u16;
        rel.formats.push(Arc::new(RowFormat::new(version, fields)));
        version
    }

    /// Register an index over field positions.
    pub fn add_index(&self, relation: RelationId, fields: Vec<usize>, unique: bool, primary: bool) {
        let mut state = self.inner.lock();
        let rel = &mut state.relations[relation as usize];
        let id = rel.indexes.len();
        rel.indexes.push(IndexInfo {
            id,
            fields,
            unique,
            primary,
        });
    }

    /// Create a sequence generator.
    pub fn define_generator(&self, name: &str, value: i64) {
        self.inner.lock().generators.insert(name.to_owned(), value);
    }

    /// Seed a committed row directly, bypassing transactions.
    pub fn insert_committed(&self, relation: RelationId, format: u16, image: Vec<u8>) -> RecordNumber {
        let mut state = self.inner.lock();
        let rel = &mut state.relations[relation as usize];
        let record = rel.next_record;
        rel.next_record += 1;
        rel.rows.insert(record, StoredRow { format, image });
        record
    }

    /// All committed rows of a relation, in record order.
    pub fn committed_rows(&self, relation: RelationId) -> Vec<(RecordNumber, u16, Vec<u8>)> {
        let state = self.inner.lock();
        state.relations[relation as usize]
            .rows
            .iter()
            .map(|(rec, row)| (*rec, row.format, row.image.clone()))
            .collect()
    }

    /// Statements recorded by `execute_immediate`.
    pub fn executed_sql(&self) -> Vec<ExecutedSql> {
        self.inner.lock().executed.clone()
    }

    /// Number of transactions currently open.
    pub fn open_transactions(&self) -> usize {
        self.inner.lock().txns.len()
    }

    /// Flip replica mode (for fatal-path tests).
    pub fn set_replica_mode(&self, on: bool) {
        self.inner.lock().replica_mode = on;
    }

    /// Flip read-only mode.
    pub fn set_read_only(&self, on: bool) {
        self.inner.lock().read_only = on;
    }

    /// Flip the replicate privilege.
    pub fn set_privileged(&self, on: bool) {
        self.inner.lock().privileged = on;
    }

    /// Flip the legacy-dialect flag.
    pub fn set_legacy_dialect(&self, on: bool) {
        self.inner.lock().legacy_dialect = on;
    }

    /// Set the master sequence the replica reports at connect time.
    pub fn set_replication_sequence(&self, sequence: u64) {
        self.inner.lock().replication_sequence = sequence;
    }
}

impl EngineState {
    fn relation(&self, id: RelationId) -> Result<&Relation> {
        self.relations
            .get(id as usize)
            .ok_or_else(|| ShadowError::Engine(format!("unknown relation id {id}")))
    }

    fn txn(&mut self, tx: TxId) -> Result<&mut Txn> {
        self.txns
            .get_mut(&tx)
            .ok_or_else(|| ShadowError::Engine(format!("unknown transaction handle {tx}")))
    }

    /// Row visible to `tx`: its own writes shadow the committed base.
    fn visible(&self, tx: TxId, relation: RelationId, record: RecordNumber) -> Option<&StoredRow> {
        if let Some(txn) = self.txns.get(&tx) {
            if let Some(overlay) = txn.writes.get(&relation) {
                if let Some(entry) = overlay.get(&record) {
                    return entry.as_ref();
                }
            }
        }
        self.relations[relation as usize].rows.get(&record)
    }

    /// All record numbers visible to `tx`, in order.
    fn visible_records(&self, tx: TxId, relation: RelationId) -> Vec<RecordNumber> {
        let rel = &self.relations[relation as usize];
        let mut records: BTreeMap<RecordNumber, bool> =
            rel.rows.keys().map(|r| (*r, true)).collect();

        if let Some(txn) = self.txns.get(&tx) {
            if let Some(overlay) = txn.writes.get(&relation) {
                for (record, entry) in overlay {
                    records.insert(*record, entry.is_some());
                }
            }
        }

        records
            .into_iter()
            .filter_map(|(r, alive)| alive.then_some(r))
            .collect()
    }

    fn key_of(&self, relation: RelationId, index: &IndexInfo, row: &StoredRow) -> Result<Vec<Option<Value>>> {
        let rel = &self.relations[relation as usize];
        let format = rel
            .formats
            .get(row.format as usize)
            .ok_or_else(|| ShadowError::Engine(format!("unknown format version {}", row.format)))?;

        index
            .fields
            .iter()
            .map(|&f| {
                if f < format.field_count() {
                    format.decode_field(&row.image, f)
                } else {
                    Ok(None)
                }
            })
            .collect()
    }

    /// Enforce unique indexes for a candidate row, ignoring `exclude`.
    fn check_unique(
        &self,
        tx: TxId,
        relation: RelationId,
        candidate: &StoredRow,
        exclude: Option<RecordNumber>,
    ) -> Result<()> {
        let rel = &self.relations[relation as usize];

        for index in rel.indexes.iter().filter(|i| i.unique) {
            let key = self.key_of(relation, index, candidate)?;

            // SQL semantics: rows with NULL key cells never collide.
            if key.iter().any(Option::is_none) {
                continue;
            }

            for record in self.visible_records(tx, relation) {
                if Some(record) == exclude {
                    continue;
                }
                let row = match self.visible(tx, relation, record) {
                    Some(row) => row,
                    None => continue,
                };
                let other = self.key_of(relation, index, row)?;
                if key
                    .iter()
                    .zip(&other)
                    .all(|(a, b)| semantically_equal(a, b))
                {
                    return Err(ShadowError::UniqueViolation {
                        relation: rel.info.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Record a write in the transaction overlay with savepoint undo.
    fn write(
        &mut self,
        tx: TxId,
        relation: RelationId,
        record: RecordNumber,
        value: Option<StoredRow>,
    ) -> Result<()> {
        let txn = self.txn(tx)?;

        let previous = txn
            .writes
            .get(&relation)
            .and_then(|overlay| overlay.get(&record))
            .cloned();

        if let Some(savepoint) = txn.savepoints.last_mut() {
            savepoint.entry((relation, record)).or_insert(previous);
        }

        txn.writes.entry(relation).or_default().insert(record, value);
        Ok(())
    }
}

impl ReplicaDatabase for MemoryEngine {
    fn is_replica(&self) -> bool {
        self.inner.lock().replica_mode
    }

    fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    fn has_replicate_privilege(&self) -> bool {
        self.inner.lock().privileged
    }

    fn legacy_dialect(&self) -> bool {
        self.inner.lock().legacy_dialect
    }

    fn replication_sequence(&self) -> Result<u64> {
        Ok(self.inner.lock().replication_sequence)
    }

    fn start_transaction(&mut self) -> Result<TxId> {
        let mut state = self.inner.lock();
        let tx = state.next_tx;
        state.next_tx += 1;
        state.txns.insert(tx, Txn::default());
        Ok(tx)
    }

    fn prepare(&mut self, tx: TxId) -> Result<()> {
        let mut state = self.inner.lock();
        state.txn(tx)?.prepared = true;
        Ok(())
    }

    fn commit(&mut self, tx: TxId) -> Result<()> {
        let mut state = self.inner.lock();
        let txn = state
            .txns
            .remove(&tx)
            .ok_or_else(|| ShadowError::Engine(format!("unknown transaction handle {tx}")))?;

        for (relation, overlay) in txn.writes {
            let rel = &mut state.relations[relation as usize];
            for (record, entry) in overlay {
                match entry {
                    Some(row) => {
                        rel.rows.insert(record, row);
                    }
                    None => {
                        rel.rows.remove(&record);
                    }
                }
            }
        }

        state.blobs.extend(txn.materialized);
        Ok(())
    }

    fn rollback(&mut self, tx: TxId) -> Result<()> {
        let mut state = self.inner.lock();
        state
            .txns
            .remove(&tx)
            .ok_or_else(|| ShadowError::Engine(format!("unknown transaction handle {tx}")))?;
        Ok(())
    }

    fn start_savepoint(&mut self, tx: TxId) -> Result<()> {
        let mut state = self.inner.lock();
        state.txn(tx)?.savepoints.push(HashMap::new());
        Ok(())
    }

    fn release_savepoint(&mut self, tx: TxId) -> Result<()> {
        let mut state = self.inner.lock();
        let txn = state.txn(tx)?;
        let released = txn
            .savepoints
            .pop()
            .ok_or_else(|| ShadowError::Engine("no savepoint to release".into()))?;

        // Fold the undo information into the parent so an outer rollback
        // still restores pre-parent state.
        if let Some(parent) = txn.savepoints.last_mut() {
            for (key, previous) in released {
                parent.entry(key).or_insert(previous);
            }
        }
        Ok(())
    }

    fn rollback_savepoint(&mut self, tx: TxId) -> Result<()> {
        let mut state = self.inner.lock();
        let txn = state.txn(tx)?;
        let undo = txn
            .savepoints
            .pop()
            .ok_or_else(|| ShadowError::Engine("no savepoint to rollback".into()))?;

        for ((relation, record), previous) in undo {
            let overlay = txn.writes.entry(relation).or_default();
            match previous {
                Some(entry) => {
                    overlay.insert(record, entry);
                }
                None => {
                    overlay.remove(&record);
                }
            }
        }
        Ok(())
    }

    fn has_savepoint(&self, tx: TxId) -> Result<bool> {
        let state = self.inner.lock();
        let txn = state
            .txns
            .get(&tx)
            .ok_or_else(|| ShadowError::Engine(format!("unknown transaction handle {tx}")))?;
        Ok(!txn.savepoints.is_empty())
    }

    fn lookup_relation(&self, name: &str) -> Option<RelationInfo> {
        let state = self.inner.lock();
        state
            .names
            .get(name)
            .map(|&id| state.relations[id as usize].info.clone())
    }

    fn relation_indexes(&self, relation: RelationId) -> Result<Vec<IndexInfo>> {
        let state = self.inner.lock();
        Ok(state.relation(relation)?.indexes.clone())
    }

    fn current_format(&self, relation: RelationId) -> Result<Arc<RowFormat>> {
        let state = self.inner.lock();
        let rel = state.relation(relation)?;
        rel.formats
            .last()
            .cloned()
            .ok_or_else(|| ShadowError::Engine(format!("relation {} has no formats", rel.info.name)))
    }

    fn format(&self, relation: RelationId, version: u16) -> Result<Arc<RowFormat>> {
        let state = self.inner.lock();
        let rel = state.relation(relation)?;
        rel.formats
            .get(version as usize)
            .cloned()
            .ok_or_else(|| {
                ShadowError::Engine(format!(
                    "relation {} has no format version {version}",
                    rel.info.name
                ))
            })
    }

    fn reserve_relation(&mut self, _tx: TxId, relation: RelationId, _writable: bool) -> Result<()> {
        let state = self.inner.lock();
        state.relation(relation)?;
        Ok(())
    }

    fn store(
        &mut self,
        tx: TxId,
        relation: RelationId,
        format: u16,
        image: &[u8],
    ) -> Result<RecordNumber> {
        let mut state = self.inner.lock();
        state.relation(relation)?;

        let row = StoredRow {
            format,
            image: image.to_vec(),
        };
        state.check_unique(tx, relation, &row, None)?;

        let record = {
            let rel = &mut state.relations[relation as usize];
            let record = rel.next_record;
            rel.next_record += 1;
            record
        };

        state.write(tx, relation, record, Some(row))?;
        Ok(record)
    }

    fn modify(
        &mut self,
        tx: TxId,
        relation: RelationId,
        record: RecordNumber,
        format: u16,
        image: &[u8],
    ) -> Result<()> {
        let mut state = self.inner.lock();

        if state.visible(tx, relation, record).is_none() {
            return Err(ShadowError::Engine(format!(
                "record {record} not found in relation {relation}"
            )));
        }

        let row = StoredRow {
            format,
            image: image.to_vec(),
        };
        state.check_unique(tx, relation, &row, Some(record))?;
        state.write(tx, relation, record, Some(row))
    }

    fn erase(&mut self, tx: TxId, relation: RelationId, record: RecordNumber) -> Result<()> {
        let mut state = self.inner.lock();

        if state.visible(tx, relation, record).is_none() {
            return Err(ShadowError::Engine(format!(
                "record {record} not found in relation {relation}"
            )));
        }

        state.write(tx, relation, record, None)
    }

    fn fetch(
        &self,
        tx: TxId,
        relation: RelationId,
        record: RecordNumber,
    ) -> Result<Option<(u16, Vec<u8>)>> {
        let state = self.inner.lock();
        state.relation(relation)?;
        Ok(state
            .visible(tx, relation, record)
            .map(|row| (row.format, row.image.clone())))
    }

    fn next_record(
        &self,
        tx: TxId,
        relation: RelationId,
        previous: Option<RecordNumber>,
    ) -> Result<Option<RecordNumber>> {
        let state = self.inner.lock();
        state.relation(relation)?;
        let records = state.visible_records(tx, relation);
        Ok(match previous {
            None => records.first().copied(),
            Some(prev) => records.into_iter().find(|&r| r > prev),
        })
    }

    fn index_lookup(
        &self,
        tx: TxId,
        relation: RelationId,
        index: usize,
        key: &[Option<Value>],
    ) -> Result<Vec<RecordNumber>> {
        let state = self.inner.lock();
        let rel = state.relation(relation)?;
        let index = rel
            .indexes
            .get(index)
            .ok_or_else(|| ShadowError::Engine(format!("unknown index {index}")))?
            .clone();

        let mut matches = Vec::new();
        for record in state.visible_records(tx, relation) {
            let row = match state.visible(tx, relation, record) {
                Some(row) => row,
                None => continue,
            };
            let row_key = state.key_of(relation, &index, row)?;
            if key
                .iter()
                .zip(&row_key)
                .all(|(a, b)| semantically_equal(a, b))
            {
                matches.push(record);
            }
        }
        Ok(matches)
    }

    fn create_blob(&mut self, tx: TxId) -> Result<u64> {
        let mut state = self.inner.lock();
        let id = state.next_blob;
        state.next_blob += 1;
        state.txn(tx)?.temp_blobs.insert(
            id,
            TempBlob {
                data: Vec::new(),
                closed: false,
            },
        );
        Ok(id)
    }

    fn blob_put(&mut self, tx: TxId, blob: u64, data: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        let temp = state
            .txn(tx)?
            .temp_blobs
            .get_mut(&blob)
            .ok_or_else(|| ShadowError::Engine(format!("unknown temporary blob {blob}")))?;
        if temp.closed {
            return Err(ShadowError::Engine(format!("blob {blob} is closed")));
        }
        temp.data.extend_from_slice(data);
        Ok(())
    }

    fn blob_close(&mut self, tx: TxId, blob: u64) -> Result<()> {
        let mut state = self.inner.lock();
        let temp = state
            .txn(tx)?
            .temp_blobs
            .get_mut(&blob)
            .ok_or_else(|| ShadowError::Engine(format!("unknown temporary blob {blob}")))?;
        temp.closed = true;
        Ok(())
    }

    fn materialize_blob(
        &mut self,
        tx: TxId,
        blob: u64,
        relation: RelationId,
        _sub_type: u8,
        _charset: u8,
    ) -> Result<u64> {
        let mut state = self.inner.lock();
        state.relation(relation)?;

        let permanent = state.next_blob;
        state.next_blob += 1;

        let txn = state.txn(tx)?;
        let temp = txn
            .temp_blobs
            .remove(&blob)
            .ok_or_else(|| ShadowError::Engine(format!("unknown temporary blob {blob}")))?;
        if !temp.closed {
            return Err(ShadowError::Engine(format!(
                "temporary blob {blob} was never closed"
            )));
        }

        txn.materialized.insert(permanent, temp.data);
        Ok(permanent)
    }

    fn read_blob(&self, blob: u64) -> Result<Vec<u8>> {
        let state = self.inner.lock();
        state
            .blobs
            .get(&blob)
            .cloned()
            .ok_or_else(|| ShadowError::Engine(format!("blob {blob} is not committed")))
    }

    fn generator_value(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.inner.lock().generators.get(name).copied())
    }

    fn set_generator(&mut self, name: &str, value: i64) -> Result<()> {
        self.inner.lock().generators.insert(name.to_owned(), value);
        Ok(())
    }

    fn execute_immediate(
        &mut self,
        tx: TxId,
        sql: &str,
        dialect: SqlDialect,
        owner: &str,
    ) -> Result<()> {
        let mut state = self.inner.lock();
        state.txn(tx)?;
        state.executed.push(ExecutedSql {
            sql: sql.to_owned(),
            owner: owner.to_owned(),
            dialect,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FieldKind;

    fn orders_engine() -> (MemoryEngine, RelationId, u16) {
        let engine = MemoryEngine::new();
        let rel = engine.define_relation("ORDERS", false);
        let format = engine.add_format(
            rel,
            vec![
                FieldDescriptor::new("ID", FieldKind::Int),
                FieldDescriptor::new("NAME", FieldKind::Text { length: 8 }),
            ],
        );
        engine.add_index(rel, vec![0], true, true);
        (engine, rel, format)
    }

    fn row(engine: &MemoryEngine, rel: RelationId, id: i32, name: &str) -> Vec<u8> {
        let format = engine.current_format(rel).unwrap();
        format
            .encode(&[Some(Value::Int(id)), Some(Value::Text(name.into()))])
            .unwrap()
    }

    #[test]
    fn committed_writes_survive_commit_only() {
        let (mut engine, rel, format) = orders_engine();
        let image = row(&engine, rel, 1, "a");

        let tx = engine.start_transaction().unwrap();
        engine.store(tx, rel, format, &image).unwrap();
        assert!(engine.committed_rows(rel).is_empty());

        engine.commit(tx).unwrap();
        assert_eq!(engine.committed_rows(rel).len(), 1);

        let tx = engine.start_transaction().unwrap();
        let image2 = row(&engine, rel, 2, "b");
        engine.store(tx, rel, format, &image2).unwrap();
        engine.rollback(tx).unwrap();
        assert_eq!(engine.committed_rows(rel).len(), 1);
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let (mut engine, rel, format) = orders_engine();
        let image = row(&engine, rel, 1, "a");
        engine.insert_committed(rel, format, image);

        let tx = engine.start_transaction().unwrap();
        let duplicate = row(&engine, rel, 1, "other");
        let err = engine.store(tx, rel, format, &duplicate).unwrap_err();
        assert!(matches!(err, ShadowError::UniqueViolation { .. }));

        // A different key goes through.
        let fresh = row(&engine, rel, 2, "b");
        engine.store(tx, rel, format, &fresh).unwrap();
    }

    #[test]
    fn own_uncommitted_writes_are_visible() {
        let (mut engine, rel, format) = orders_engine();

        let tx = engine.start_transaction().unwrap();
        let image = row(&engine, rel, 5, "x");
        let record = engine.store(tx, rel, format, &image).unwrap();

        assert!(engine.fetch(tx, rel, record).unwrap().is_some());
        let found = engine
            .index_lookup(tx, rel, 0, &[Some(Value::Int(5))])
            .unwrap();
        assert_eq!(found, vec![record]);
    }

    #[test]
    fn savepoint_rollback_undoes_writes() {
        let (mut engine, rel, format) = orders_engine();
        let base = engine.insert_committed(rel, format, row(&engine, rel, 1, "a"));

        let tx = engine.start_transaction().unwrap();
        engine.start_savepoint(tx).unwrap();
        engine.erase(tx, rel, base).unwrap();
        let added = engine
            .store(tx, rel, format, &row(&engine, rel, 2, "b"))
            .unwrap();

        engine.rollback_savepoint(tx).unwrap();
        assert!(engine.fetch(tx, rel, base).unwrap().is_some());
        assert!(engine.fetch(tx, rel, added).unwrap().is_none());
    }

    #[test]
    fn released_savepoint_folds_into_parent() {
        let (mut engine, rel, format) = orders_engine();
        let base = engine.insert_committed(rel, format, row(&engine, rel, 1, "a"));

        let tx = engine.start_transaction().unwrap();
        engine.start_savepoint(tx).unwrap();
        engine.start_savepoint(tx).unwrap();
        engine.erase(tx, rel, base).unwrap();
        engine.release_savepoint(tx).unwrap();

        // The inner change survives the release but the outer rollback
        // still restores it.
        assert!(engine.fetch(tx, rel, base).unwrap().is_none());
        engine.rollback_savepoint(tx).unwrap();
        assert!(engine.fetch(tx, rel, base).unwrap().is_some());
    }

    #[test]
    fn blob_staging_and_materialization() {
        let (mut engine, rel, _format) = orders_engine();

        let tx = engine.start_transaction().unwrap();
        let temp = engine.create_blob(tx).unwrap();
        engine.blob_put(tx, temp, b"hel").unwrap();
        engine.blob_put(tx, temp, b"lo").unwrap();
        engine.blob_close(tx, temp).unwrap();

        let permanent = engine.materialize_blob(tx, temp, rel, 1, 0).unwrap();
        assert_ne!(permanent, temp);

        // Not readable until commit.
        assert!(engine.read_blob(permanent).is_err());
        engine.commit(tx).unwrap();
        assert_eq!(engine.read_blob(permanent).unwrap(), b"hello");
    }

    #[test]
    fn rolled_back_blobs_disappear() {
        let (mut engine, rel, _format) = orders_engine();

        let tx = engine.start_transaction().unwrap();
        let temp = engine.create_blob(tx).unwrap();
        engine.blob_put(tx, temp, b"gone").unwrap();
        engine.blob_close(tx, temp).unwrap();
        let permanent = engine.materialize_blob(tx, temp, rel, 1, 0).unwrap();

        engine.rollback(tx).unwrap();
        assert!(engine.read_blob(permanent).is_err());
    }

    #[test]
    fn sequential_scan_walks_visible_records() {
        let (mut engine, rel, format) = orders_engine();
        engine.insert_committed(rel, format, row(&engine, rel, 1, "a"));
        engine.insert_committed(rel, format, row(&engine, rel, 2, "b"));

        let tx = engine.start_transaction().unwrap();
        let mut seen = Vec::new();
        let mut cursor = None;
        while let Some(record) = engine.next_record(tx, rel, cursor).unwrap() {
            seen.push(record);
            cursor = Some(record);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn generators_are_non_transactional() {
        let mut engine = MemoryEngine::new();
        engine.define_generator("GEN_A", 10);

        let tx = engine.start_transaction().unwrap();
        engine.set_generator("GEN_A", 50).unwrap();
        engine.rollback(tx).unwrap();

        assert_eq!(engine.generator_value("GEN_A").unwrap(), Some(50));
    }
}
