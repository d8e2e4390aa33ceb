//! Min-heap k-way merge over shard cursors, keyed by `(pk, payload)` instead
//! of `(key, lsn desc)`. Shape follows `engine/utils.rs`'s `MergeIterator`:
//! seed one heap entry per source, then pop-refill-from-same-source on each
//! step.

use crate::schema::{compare_column_values, ColumnValue, PrimaryKey, Weight};
use crate::shard::{ShardError, ShardView};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A single position into one shard's ascending `(pk, payload)` stream.
pub struct ShardCursor<'a> {
    view: &'a ShardView,
    idx: usize,
    current: Option<(PrimaryKey, Vec<ColumnValue>, Weight)>,
}

impl<'a> ShardCursor<'a> {
    pub fn new(view: &'a ShardView) -> Result<Self, ShardError> {
        let mut cursor = ShardCursor { view, idx: 0, current: None };
        cursor.advance()?;
        Ok(cursor)
    }

    pub fn peek(&self) -> Option<&(PrimaryKey, Vec<ColumnValue>, Weight)> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> Result<(), ShardError> {
        if self.idx >= self.view.len() {
            self.current = None;
            return Ok(());
        }
        let pk = self.view.pk_at(self.idx)?;
        let payload = self.view.payload_at(self.idx)?;
        let weight = self.view.weight_at(self.idx)?;
        self.current = Some((pk, payload, weight));
        self.idx += 1;
        Ok(())
    }
}

struct HeapEntry {
    pk: PrimaryKey,
    payload: Vec<ColumnValue>,
    weight: Weight,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.pk == other.pk && compare_column_values(&self.payload, &other.payload) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    /// Min-heap: reverse so the smallest `(pk, payload)` pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.pk
            .cmp(&other.pk)
            .then_with(|| compare_column_values(&self.payload, &other.payload))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// N-way merge over a fixed set of shard cursors, yielding records in
/// ascending `(pk, payload)` order. Ties at equal `(pk, payload)` are
/// adjacent in the output, letting the compactor sum weights by a simple
/// run-length scan.
pub struct TournamentTree<'a> {
    cursors: Vec<ShardCursor<'a>>,
    heap: BinaryHeap<HeapEntry>,
}

impl<'a> TournamentTree<'a> {
    pub fn new(cursors: Vec<ShardCursor<'a>>) -> Self {
        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (source, cursor) in cursors.iter().enumerate() {
            if let Some((pk, payload, weight)) = cursor.peek() {
                heap.push(HeapEntry { pk: *pk, payload: payload.clone(), weight: *weight, source });
            }
        }
        TournamentTree { cursors, heap }
    }

    /// The next record to be yielded, without consuming it.
    pub fn peek(&self) -> Option<(usize, PrimaryKey)> {
        self.heap.peek().map(|e| (e.source, e.pk))
    }
}

impl<'a> Iterator for TournamentTree<'a> {
    type Item = Result<(PrimaryKey, Vec<ColumnValue>, Weight), ShardError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.heap.pop()?;
        if let Err(e) = self.cursors[entry.source].advance() {
            return Some(Err(e));
        }
        if let Some((pk, payload, weight)) = self.cursors[entry.source].peek() {
            self.heap.push(HeapEntry { pk: *pk, payload: payload.clone(), weight: *weight, source: entry.source });
        }
        Some(Ok((entry.pk, entry.payload, entry.weight)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::schema::{ColumnDef, ColumnType, PkVariant, PrimaryKey, TableSchema};
    use crate::shard::ShardWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(1, PkVariant::U64, vec![ColumnDef::new("pk", ColumnType::U64), ColumnDef::new("v", ColumnType::I64)], 0))
    }

    fn write_shard(dir: &std::path::Path, name: &str, rows: &[(u64, i64, i64, u64)]) -> ShardView {
        let schema = schema();
        let mut table = Memtable::new(schema.clone(), 1 << 16);
        for &(pk, v, weight, lsn) in rows {
            table.upsert(PrimaryKey::U64(pk), &[ColumnValue::I64(v)], weight, lsn).unwrap();
        }
        let path = dir.join(name);
        ShardWriter::write(&path, &table).unwrap();
        ShardView::open(&path, schema).unwrap()
    }

    #[test]
    fn merges_two_shards_in_ascending_pk_order() {
        let dir = tempdir().unwrap();
        let a = write_shard(dir.path(), "a.shard", &[(1, 10, 1, 1), (3, 30, 1, 1)]);
        let b = write_shard(dir.path(), "b.shard", &[(2, 20, 1, 1)]);

        let cursors = vec![ShardCursor::new(&a).unwrap(), ShardCursor::new(&b).unwrap()];
        let tree = TournamentTree::new(cursors);
        let pks: Vec<u64> = tree
            .map(|r| match r.unwrap().0 {
                PrimaryKey::U64(v) => v,
                PrimaryKey::U128(_) => unreachable!(),
            })
            .collect();
        assert_eq!(pks, vec![1, 2, 3]);
    }

    #[test]
    fn equal_pk_records_are_adjacent_for_grouping() {
        let dir = tempdir().unwrap();
        let a = write_shard(dir.path(), "a.shard", &[(5, 1, 1, 1)]);
        let b = write_shard(dir.path(), "b.shard", &[(5, 1, 2, 2)]);

        let cursors = vec![ShardCursor::new(&a).unwrap(), ShardCursor::new(&b).unwrap()];
        let tree = TournamentTree::new(cursors);
        let records: Vec<_> = tree.collect::<Result<Vec<_>, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records.iter().map(|r| r.2).sum::<i64>(), 3);
        assert!(records.iter().all(|r| r.0 == PrimaryKey::U64(5)));
    }
}
