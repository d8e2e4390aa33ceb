//! End-to-end scenarios against the public `Engine` surface: annihilation,
//! multiset accumulation, restart recovery, compaction equivalence, ghost
//! elision across compaction, and WAL truncation after a flush.

use std::sync::Arc;

use zsetdb::engine::{Engine, EngineConfig, IngestBatch};
use zsetdb::schema::{ColumnDef, ColumnType, ColumnValue, PkVariant, PrimaryKey, TableSchema};

fn schema() -> Arc<TableSchema> {
    Arc::new(TableSchema::new(
        1,
        PkVariant::U64,
        vec![ColumnDef::new("pk", ColumnType::U64), ColumnDef::new("amount", ColumnType::I64)],
        0,
    ))
}

fn batch(schema: &TableSchema, rows: Vec<(PrimaryKey, Vec<ColumnValue>, i64)>) -> IngestBatch {
    IngestBatch::new(schema.schema_hash(), rows)
}

fn low_overlap_config() -> EngineConfig {
    EngineConfig { compaction_overlap_threshold: 1, ..EngineConfig::default() }
}

/// S1: a pair of opposite-weight ingests for the same `(pk, payload)`
/// annihilates — `weight_of` reports zero immediately, and flushing writes
/// no surviving record for it at all.
#[test]
fn s1_annihilation() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

    let lsn1 = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(100), vec![ColumnValue::I64(42)], 1)])).unwrap();
    assert_eq!(lsn1, 1);
    let lsn2 = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(100), vec![ColumnValue::I64(42)], -1)])).unwrap();
    assert_eq!(lsn2, 2);

    assert_eq!(engine.weight_of(PrimaryKey::U64(100), &[ColumnValue::I64(42)]).unwrap(), 0);

    engine.flush().unwrap();
    assert_eq!(engine.weight_of(PrimaryKey::U64(100), &[ColumnValue::I64(42)]).unwrap(), 0);
    assert!(engine.cursor().unwrap().is_empty());
}

/// S2: distinct payloads under the same PK accumulate independently — a
/// Z-Set is a multiset over `(pk, payload)`, not a single-valued map per PK.
#[test]
fn s2_multiset_per_pk() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 2)])).unwrap();
    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(20)], 5)])).unwrap();
    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 3)])).unwrap();

    assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap(), 5);
    assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(20)]).unwrap(), 5);

    let mut rows = engine.cursor().unwrap();
    rows.sort_by_key(|r| match r.payload[0] {
        ColumnValue::I64(v) => v,
        _ => unreachable!(),
    });
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].weight, 5);
    assert_eq!(rows[1].weight, 5);
}

/// S3: after a flush and clean close, reopening the table recovers the
/// manifest's shard set and the engine reports the same weights with no WAL
/// replay needed.
#[test]
fn s3_restart_after_flush_recovers_manifest_state() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    {
        let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();
        engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(7), vec![ColumnValue::I64(99)], 4)])).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(dir.path(), schema, EngineConfig::default()).unwrap();
    assert_eq!(engine.weight_of(PrimaryKey::U64(7), &[ColumnValue::I64(99)]).unwrap(), 4);
    assert_eq!(engine.cursor().unwrap().len(), 1);
}

/// S4: compacting a table's shards does not change what `weight_of`/
/// `cursor` report for any surviving key — merging is an internal
/// representation change, never an observable one.
#[test]
fn s4_compaction_preserves_observable_weights() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    let engine = Engine::open(dir.path(), schema.clone(), low_overlap_config()).unwrap();

    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 3)])).unwrap();
    engine.flush().unwrap();
    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 2)])).unwrap();
    engine.flush().unwrap();
    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(20)], 1)])).unwrap();
    engine.flush().unwrap();

    let before = engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap();
    assert_eq!(before, 5);

    let outcome = engine.maybe_compact().unwrap();
    assert!(outcome.is_some(), "three overlapping single-row shards should exceed the overlap threshold");

    let after = engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap();
    assert_eq!(after, before);
    assert_eq!(engine.weight_of(PrimaryKey::U64(2), &[ColumnValue::I64(20)]).unwrap(), 1);
}

/// S5: when compaction's input shards sum a `(pk, payload)` group to zero,
/// the merged output carries no record for it — the Ghost Property holds
/// across compaction, not just within a single MemTable.
#[test]
fn s5_ghost_elision_survives_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    let engine = Engine::open(dir.path(), schema.clone(), low_overlap_config()).unwrap();

    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], 5)])).unwrap();
    engine.flush().unwrap();
    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(10)], -5)])).unwrap();
    engine.flush().unwrap();
    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(20)], 1)])).unwrap();
    engine.flush().unwrap();

    let outcome = engine.maybe_compact().unwrap().expect("overlap threshold exceeded");
    assert!(outcome.published.is_some() || engine.cursor().unwrap().iter().all(|r| r.pk != PrimaryKey::U64(1)));

    assert_eq!(engine.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(10)]).unwrap(), 0);
    let rows = engine.cursor().unwrap();
    assert!(rows.iter().all(|r| r.pk != PrimaryKey::U64(1)));
    assert_eq!(rows.len(), 1);
}

/// S6: once a flush has moved every MemTable row into a shard, the WAL is
/// truncated to empty, and `snapshot_lsn` continues to reflect the last
/// ingested batch rather than resetting.
#[test]
fn s6_flush_truncates_wal_snapshot_lsn_unaffected() {
    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(1)], 1)])).unwrap();
    let lsn2 = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(2)], 1)])).unwrap();
    assert_eq!(engine.snapshot_lsn().unwrap(), lsn2);

    assert_eq!(engine.subscribe_wal(1).unwrap().len(), 2);

    engine.flush().unwrap();
    assert!(engine.subscribe_wal(1).unwrap().is_empty());
    assert_eq!(engine.snapshot_lsn().unwrap(), lsn2);
}

/// A batch built against a different schema hash is rejected outright, and
/// a table that has gone degraded from a fatal ingest failure stays closed
/// to writes until it is reopened.
#[test]
fn rejects_mismatched_schema_and_stays_degraded_after_fatal_failure() {
    use zsetdb::engine::EngineError;
    use zsetdb::schema::SchemaError;

    let dir = tempfile::tempdir().unwrap();
    let schema = schema();
    let engine = Engine::open(dir.path(), schema.clone(), EngineConfig::default()).unwrap();

    let mut stale = batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(1)], 1)]);
    stale.schema_hash = stale.schema_hash.wrapping_add(1);
    let err = engine.ingest(&stale).unwrap_err();
    assert!(matches!(err, EngineError::Schema(SchemaError::SchemaMismatch { .. })));
    assert_eq!(engine.snapshot_lsn().unwrap(), 0);

    engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(1)], i64::MAX)])).unwrap();
    let err = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(1), vec![ColumnValue::I64(1)], 1)])).unwrap_err();
    assert!(err.is_fatal());

    let err = engine.ingest(&batch(&schema, vec![(PrimaryKey::U64(2), vec![ColumnValue::I64(2)], 1)])).unwrap_err();
    assert!(matches!(err, EngineError::Degraded));

    let reopened = Engine::open(dir.path(), schema, EngineConfig::default()).unwrap();
    assert_eq!(reopened.weight_of(PrimaryKey::U64(1), &[ColumnValue::I64(1)]).unwrap(), i64::MAX);
}
