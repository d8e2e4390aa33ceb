//! Engine coordinator: owns the WAL, active MemTable, manifest,
//! shard registry, and refcounter for one table, and wires their lifecycles
//! together under a single `Arc<ShardedLock<EngineInner>>`, implementing a
//! single-writer-multiple-reader concurrency model. `ShardedLock` is a better
//! fit than a plain `RwLock` here: every read path (`weight_of`, `cursor`)
//! vastly outnumbers the single-writer path (`ingest`, `flush`,
//! `maybe_compact`), which is exactly the access pattern it shards reads for.
//!
//! Single writer for WAL/MemTable/manifest; shard files and the manifest are
//! read-only to every other thread once published. Compaction runs
//! in-process under the same writer lock for its swap step.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::sync::ShardedLock;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::compaction::{self, CompactionError, CompactionOutcome};
use crate::manifest::{Manifest, ManifestEntry, ManifestError};
use crate::memtable::{Memtable, MemtableError};
use crate::refcounter::{RefCounter, RefCounterError};
use crate::registry::ShardRegistry;
use crate::schema::{compare_column_values, ColumnValue, PrimaryKey, SchemaError, TableSchema, Weight};
use crate::shard::{ShardError, ShardView, ShardWriter};
use crate::wal::{Wal, WalBlock, WalEntry, WalError};

const WAL_FILENAME: &str = "WAL";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error(transparent)]
    Memtable(#[from] MemtableError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Compaction(#[from] CompactionError),
    #[error(transparent)]
    RefCounter(#[from] RefCounterError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("table is degraded after a fatal ingest failure and rejects further writes until reopened")]
    Degraded,
    #[error("engine lock poisoned by a prior panic")]
    LockPoisoned,
}

impl EngineError {
    /// Whether this error leaves the WAL and MemTable potentially diverged,
    /// so the table must stop accepting ingests until it is reopened (which
    /// replays the WAL back over a fresh MemTable). Only a weight overflow
    /// raised by `Memtable::upsert` after the WAL block has already been
    /// fsynced qualifies: every other error here is caught before the WAL
    /// append commits, so rejecting the one batch is enough.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Memtable(MemtableError::Schema(SchemaError::WeightOverflow(_, _))))
    }
}

/// Environment knobs for one table's engine. `wal_fsync = false` is accepted
/// but logged as test-only; it must never be the silent default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// MemTable byte occupancy that triggers a seal-and-flush.
    pub memtable_seal_bytes: usize,
    /// Slab size for each MemTable's staging and blob arenas.
    pub arena_slab_bytes: usize,
    /// Overlap depth above which the registry proposes compaction.
    pub compaction_overlap_threshold: u32,
    /// Whether WAL appends fsync before returning. `false` is test-only.
    pub wal_fsync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            memtable_seal_bytes: 64 * 1024 * 1024,
            arena_slab_bytes: 64 * 1024 * 1024,
            compaction_overlap_threshold: 4,
            wal_fsync: true,
        }
    }
}

/// One materialized, non-annihilated Z-Set record as yielded by
/// [`Engine::cursor`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRow {
    pub pk: PrimaryKey,
    pub payload: Vec<ColumnValue>,
    pub weight: Weight,
}

/// A write intent for [`Engine::ingest`]: the schema hash the caller built
/// `rows` against, plus the weighted row deltas themselves. The hash is
/// checked against the table's own before anything is applied, so a caller
/// holding a stale schema can't silently corrupt a table that has since
/// changed shape.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    pub schema_hash: u64,
    pub rows: Vec<(PrimaryKey, Vec<ColumnValue>, Weight)>,
}

impl IngestBatch {
    pub fn new(schema_hash: u64, rows: Vec<(PrimaryKey, Vec<ColumnValue>, Weight)>) -> Self {
        IngestBatch { schema_hash, rows }
    }
}

struct OpenShard {
    entry: ManifestEntry,
    view: ShardView,
}

struct EngineInner {
    schema: Arc<TableSchema>,
    table_dir: PathBuf,
    wal: Wal,
    active: Memtable,
    manifest: Manifest,
    registry: ShardRegistry,
    refcounter: RefCounter,
    shards: Vec<OpenShard>,
    next_lsn: u64,
    config: EngineConfig,
    /// Set once a post-fsync ingest failure leaves the WAL and MemTable
    /// potentially diverged. `ingest` rejects everything while this holds;
    /// clears only by reopening the table, which replays the WAL fresh.
    degraded: bool,
}

/// Handle to one table's storage. Thread-safe — clone and share across
/// threads via the internal `Arc<ShardedLock<_>>`.
pub struct Engine {
    inner: Arc<ShardedLock<EngineInner>>,
}

impl Clone for Engine {
    fn clone(&self) -> Self {
        Engine { inner: Arc::clone(&self.inner) }
    }
}

impl Engine {
    /// Loads the manifest, opens every live shard, replays the WAL tail past
    /// `global_max_lsn`, and constructs the registry.
    pub fn open(table_dir: impl AsRef<Path>, schema: Arc<TableSchema>, config: EngineConfig) -> Result<Self, EngineError> {
        let table_dir = table_dir.as_ref().to_path_buf();
        fs::create_dir_all(&table_dir)?;

        let manifest = Manifest::open(&table_dir)?;
        let table_id = schema.table_id();
        let entries = manifest.entries_for_table(table_id);

        let refcounter = RefCounter::new();
        let registry = ShardRegistry::new(config.compaction_overlap_threshold);
        registry.refresh(table_id, entries.clone());

        let mut shards = Vec::with_capacity(entries.len());
        for entry in entries {
            refcounter.acquire(table_dir.join(&entry.path));
            let view = ShardView::open(table_dir.join(&entry.path), schema.clone())?;
            shards.push(OpenShard { entry, view });
        }

        let mut wal = Wal::open(table_dir.join(WAL_FILENAME), schema.clone(), config.wal_fsync)?;
        let mut active = Memtable::new(schema.clone(), config.arena_slab_bytes);

        let global_max_lsn = manifest.global_max_lsn();
        let blocks = wal.replay()?;
        let mut next_lsn = global_max_lsn + 1;
        for block in blocks {
            if block.lsn <= global_max_lsn {
                continue;
            }
            for entry in &block.entries {
                active.upsert(entry.pk, &entry.payload, entry.weight, block.lsn)?;
            }
            next_lsn = next_lsn.max(block.lsn + 1);
        }

        info!(table_id, shards = shards.len(), next_lsn, "engine opened");

        let inner = EngineInner { schema, table_dir, wal, active, manifest, registry, refcounter, shards, next_lsn, config, degraded: false };
        Ok(Engine { inner: Arc::new(ShardedLock::new(inner)) })
    }

    /// Appends one batch to the WAL, fsyncs, then applies it to the active
    /// MemTable. Triggers a flush if the seal threshold is now exceeded.
    /// Returns the assigned LSN.
    ///
    /// Rejected, with no state change, if the table is degraded, if
    /// `batch.schema_hash` disagrees with the table's own, or if any row's
    /// primary key is the wrong variant for the table.
    pub fn ingest(&self, batch: &IngestBatch) -> Result<u64, EngineError> {
        let mut inner = self.inner.write().map_err(|_| EngineError::LockPoisoned)?;

        if inner.degraded {
            return Err(EngineError::Degraded);
        }
        if batch.schema_hash != inner.schema.schema_hash() {
            return Err(SchemaError::SchemaMismatch { batch: batch.schema_hash, table: inner.schema.schema_hash() }.into());
        }
        for (pk, _, _) in &batch.rows {
            let got = pk.variant();
            let expected = inner.schema.pk_variant();
            if got != expected {
                return Err(SchemaError::PkVariantMismatch { expected, got }.into());
            }
        }

        let lsn = inner.next_lsn;
        let entries: Vec<WalEntry> =
            batch.rows.iter().map(|(pk, payload, weight)| WalEntry { pk: *pk, payload: payload.clone(), weight: *weight }).collect();
        let table_id = inner.schema.table_id() as u32;
        inner.wal.append(lsn, table_id, &entries)?;
        inner.next_lsn += 1;

        for entry in &entries {
            if let Err(e) = inner.active.upsert(entry.pk, &entry.payload, entry.weight, lsn) {
                let e: EngineError = e.into();
                if e.is_fatal() {
                    inner.degraded = true;
                }
                return Err(e);
            }
        }

        if inner.active.byte_occupancy() >= inner.config.memtable_seal_bytes {
            Self::flush_inner(&mut inner)?;
        }

        Ok(lsn)
    }

    /// Sums the MemTable weight and every shard's weight for `(pk,
    /// payload)` under full-row semantic equality.
    pub fn weight_of(&self, pk: PrimaryKey, payload: &[ColumnValue]) -> Result<Weight, EngineError> {
        let inner = self.inner.read().map_err(|_| EngineError::LockPoisoned)?;
        let mut total = inner.active.weight_of(pk, payload)?;

        for shard in &inner.shards {
            if !(shard.entry.min_pk <= pk && pk <= shard.entry.max_pk) {
                continue;
            }
            let range = shard.view.find_pk(pk)?;
            for i in range {
                if compare_column_values(&shard.view.payload_at(i)?, payload) == Ordering::Equal {
                    total += shard.view.weight_at(i)?;
                }
            }
        }
        Ok(total)
    }

    /// The LSN of the most recently assigned batch, i.e. `next_lsn - 1`, or
    /// `0` if nothing has been ingested yet. External collaborators use this
    /// to fence a read against a point in the ingest stream.
    pub fn snapshot_lsn(&self) -> Result<u64, EngineError> {
        let inner = self.inner.read().map_err(|_| EngineError::LockPoisoned)?;
        Ok(inner.next_lsn.saturating_sub(1))
    }

    /// A read-only tail of WAL blocks with `lsn >= from_lsn`, for an external
    /// collaborator that wants to mirror ingest without racing the active
    /// MemTable. Re-reads the WAL file under the write lock rather than
    /// maintaining a live cursor, since the WAL is expected to hold at most
    /// one seal interval's worth of blocks at any time.
    pub fn subscribe_wal(&self, from_lsn: u64) -> Result<Vec<WalBlock>, EngineError> {
        let mut inner = self.inner.write().map_err(|_| EngineError::LockPoisoned)?;
        let blocks = inner.wal.replay()?;
        Ok(blocks.into_iter().filter(|b| b.lsn >= from_lsn).collect())
    }

    /// Ordered union over the MemTable and every shard, grouped by `(pk,
    /// payload)` with weights summed, yielding only records whose net
    /// weight survives annihilation. Materialized eagerly: this coordinator
    /// is meant for a handful of shards per table, not a streaming scan
    /// over an unbounded on-disk set.
    pub fn cursor(&self) -> Result<Vec<EngineRow>, EngineError> {
        let inner = self.inner.read().map_err(|_| EngineError::LockPoisoned)?;

        let mut rows: Vec<(PrimaryKey, Vec<ColumnValue>, Weight)> =
            inner.active.cursor_ascending().map(|row| (row.pk, row.payload, row.weight)).collect();
        for shard in &inner.shards {
            for i in 0..shard.view.len() {
                rows.push((shard.view.pk_at(i)?, shard.view.payload_at(i)?, shard.view.weight_at(i)?));
            }
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| compare_column_values(&a.1, &b.1)));

        let mut out = Vec::with_capacity(rows.len());
        let mut iter = rows.into_iter();
        if let Some((mut pk, mut payload, mut weight)) = iter.next() {
            for (next_pk, next_payload, next_weight) in iter {
                if next_pk == pk && compare_column_values(&next_payload, &payload) == Ordering::Equal {
                    weight += next_weight;
                } else {
                    if weight != 0 {
                        out.push(EngineRow { pk, payload, weight });
                    }
                    pk = next_pk;
                    payload = next_payload;
                    weight = next_weight;
                }
            }
            if weight != 0 {
                out.push(EngineRow { pk, payload, weight });
            }
        }
        Ok(out)
    }

    /// Seals the active MemTable, transmutes it into a new shard, swaps the
    /// manifest, and truncates the WAL.
    pub fn flush(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.write().map_err(|_| EngineError::LockPoisoned)?;
        Self::flush_inner(&mut inner)
    }

    fn flush_inner(inner: &mut EngineInner) -> Result<(), EngineError> {
        if inner.active.is_empty() {
            return Ok(());
        }

        let mut sealed = std::mem::replace(&mut inner.active, Memtable::new(inner.schema.clone(), inner.config.arena_slab_bytes));
        sealed.seal();

        let min_lsn = inner.manifest.global_max_lsn() + 1;
        let max_lsn = sealed.cursor_ascending().map(|row| row.max_lsn).max().unwrap_or(min_lsn);

        let shards_dir = inner.table_dir.join("shards");
        fs::create_dir_all(&shards_dir)?;
        let rel_path = PathBuf::from("shards").join(format!("{}.shard", Uuid::new_v4()));
        let out_path = inner.table_dir.join(&rel_path);

        let written = match ShardWriter::write(&out_path, &sealed) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(out_path.with_extension("shard.tmp"));
                return Err(e.into());
            }
        };

        if let Some(()) = written {
            let min_pk = sealed.cursor_ascending().filter(|r| r.weight != 0).map(|r| r.pk).min().expect("write succeeded so at least one row survives");
            let max_pk = sealed.cursor_ascending().filter(|r| r.weight != 0).map(|r| r.pk).max().expect("write succeeded so at least one row survives");

            let entry = ManifestEntry {
                table_id: inner.schema.table_id(),
                path: rel_path,
                pk_variant: inner.schema.pk_variant(),
                min_pk,
                max_pk,
                min_lsn,
                max_lsn,
                schema_hash: inner.schema.schema_hash(),
            };

            let mut new_entries = inner.manifest.entries();
            new_entries.push(entry.clone());
            let new_global_max_lsn = inner.manifest.global_max_lsn().max(max_lsn);
            inner.manifest.swap(new_entries, new_global_max_lsn)?;

            inner.refcounter.acquire(inner.table_dir.join(&entry.path));
            let view = ShardView::open(inner.table_dir.join(&entry.path), inner.schema.clone())?;
            inner.shards.push(OpenShard { entry, view });
            inner.registry.refresh(inner.schema.table_id(), inner.manifest.entries_for_table(inner.schema.table_id()));
        }

        inner.wal.truncate_all()?;
        debug!(table_id = inner.schema.table_id(), "memtable flushed");
        Ok(())
    }

    /// Consults the registry; runs one compaction round if a candidate set
    /// exists above the overlap threshold.
    pub fn maybe_compact(&self) -> Result<Option<CompactionOutcome>, EngineError> {
        let mut inner = self.inner.write().map_err(|_| EngineError::LockPoisoned)?;
        let table_dir = inner.table_dir.clone();
        let outcome =
            compaction::maybe_compact(&inner.schema, &inner.manifest, &inner.registry, &inner.refcounter, &table_dir)?;

        if let Some(outcome) = &outcome {
            let removed: Vec<PathBuf> = outcome.removed.iter().map(|e| e.path.clone()).collect();
            inner.shards.retain(|s| !removed.contains(&s.entry.path));

            if let Some(published) = &outcome.published {
                inner.refcounter.acquire(table_dir.join(&published.path));
                let view = ShardView::open(table_dir.join(&published.path), inner.schema.clone())?;
                inner.shards.push(OpenShard { entry: published.clone(), view });
            }
        }
        Ok(outcome)
    }

    /// Releases every open shard's refcount handle and persists the
    /// manifest's current state. The MemTable and WAL are left as-is;
    /// replay on the next [`Engine::open`] reconstructs them.
    pub fn close(&self) -> Result<(), EngineError> {
        let inner = self.inner.write().map_err(|_| EngineError::LockPoisoned)?;
        for shard in &inner.shards {
            inner.refcounter.release(inner.table_dir.join(&shard.entry.path))?;
        }
        info!(table_id = inner.schema.table_id(), "engine closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, PkVariant};
    use tempfile::tempdir;

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(1, PkVariant::U64, vec![ColumnDef::new("pk", ColumnType::U64), ColumnDef::new("v", ColumnType::I64)], 0))
    }

    fn batch(schema: &TableSchema, rows: Vec<(PrimaryKey, Vec<ColumnValue>, Weight)>) -> IngestBatch {
        IngestBatch::new(schema.schema_hash(), rows)
    }

    #[test]
    fn ingest_then_weight_of_sees_memtable_only() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 3)])).unwrap();
        assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap(), 3);
    }

    #[test]
    fn flush_moves_rows_into_a_shard_and_clears_wal() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 3)])).unwrap();
        engine.flush().unwrap();

        assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap(), 3);
        let inner = engine.inner.read().unwrap();
        assert_eq!(inner.shards.len(), 1);
        assert!(inner.active.is_empty());
    }

    #[test]
    fn reopen_after_flush_recovers_manifest_state() {
        let dir = tempdir().unwrap();
        let schema = schema();
        {
            let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
            engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 3)])).unwrap();
            engine.flush().unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(dir.path(), schema, EngineConfig::default()).unwrap();
        assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap(), 3);
    }

    #[test]
    fn reopen_without_flush_replays_wal() {
        let dir = tempdir().unwrap();
        let schema = schema();
        {
            let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
            engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 3)])).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(dir.path(), schema, EngineConfig::default()).unwrap();
        assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap(), 3);
    }

    #[test]
    fn snapshot_lsn_tracks_the_last_assigned_batch() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
        assert_eq!(engine.snapshot_lsn().unwrap(), 0);
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 1)])).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(20)], 1)])).unwrap();
        assert_eq!(engine.snapshot_lsn().unwrap(), 2);
    }

    #[test]
    fn subscribe_wal_filters_to_blocks_at_or_after_from_lsn() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 1)])).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(20)], 1)])).unwrap();

        let blocks = engine.subscribe_wal(2).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lsn, 2);
    }

    #[test]
    fn cursor_merges_memtable_and_shards_with_zero_weight_dropped() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 5)])).unwrap();
        engine.flush().unwrap();
        engine
            .ingest(&batch(
                &schema,
                vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], -5), (PrimaryKey::U64(2), vec![ColumnValue::I64(20)], 1)],
            ))
            .unwrap();

        let rows = engine.cursor().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pk, PrimaryKey::U64(2));
    }

    #[test]
    fn ingest_rejects_batch_with_wrong_schema_hash_and_leaves_state_unchanged() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

        let mut stale = IngestBatch::new(schema.schema_hash(), vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 1)]);
        stale.schema_hash = stale.schema_hash.wrapping_add(1);

        let err = engine.ingest(&stale).unwrap_err();
        assert!(matches!(err, EngineError::Schema(SchemaError::SchemaMismatch { .. })));
        assert_eq!(engine.snapshot_lsn().unwrap(), 0);
        assert!(engine.cursor().unwrap().is_empty());
    }

    #[test]
    fn ingest_rejects_batch_with_wrong_pk_variant() {
        let dir = tempdir().unwrap();
        let schema = Arc::new(TableSchema::new(1, PkVariant::U128, vec![ColumnDef::new("pk", ColumnType::U64), ColumnDef::new("v", ColumnType::I64)], 0));
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

        let err = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 1)])).unwrap_err();
        assert!(matches!(err, EngineError::Schema(SchemaError::PkVariantMismatch { .. })));
    }

    #[test]
    fn weight_overflow_after_fsync_marks_the_table_degraded() {
        let dir = tempdir().unwrap();
        let schema = schema();
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], i64::MAX)])).unwrap();
        let err = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 1)])).unwrap_err();
        assert!(err.is_fatal());

        let err = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(20)], 1)])).unwrap_err();
        assert!(matches!(err, EngineError::Degraded));
    }
}
