//! In-memory projection of the manifest: per-table shard ranges, overlap
//! tracking, and compaction candidate selection.

use crate::manifest::ManifestEntry;
use crate::schema::PrimaryKey;
use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks, per table, the live shard set ordered by `min_pk` and exposes
/// overlap-driven compaction candidate selection. Refreshed wholesale after
/// every manifest swap — there is no incremental bookkeeping to keep
/// consistent with the manifest's own atomic-replace model.
pub struct ShardRegistry {
    tables: Mutex<HashMap<u64, Vec<ManifestEntry>>>,
    overlap_threshold: u32,
}

impl ShardRegistry {
    pub fn new(overlap_threshold: u32) -> Self {
        ShardRegistry { tables: Mutex::new(HashMap::new()), overlap_threshold }
    }

    /// Replaces the known shard set for `table_id`, sorted by `min_pk`.
    pub fn refresh(&self, table_id: u64, mut entries: Vec<ManifestEntry>) {
        entries.sort_by(|a, b| a.min_pk.cmp(&b.min_pk));
        self.tables.lock().expect("registry mutex poisoned").insert(table_id, entries);
    }

    /// Shards whose `[min_pk, max_pk]` contains `pk`.
    pub fn shards_covering(&self, table_id: u64, pk: PrimaryKey) -> Vec<ManifestEntry> {
        let tables = self.tables.lock().expect("registry mutex poisoned");
        tables
            .get(&table_id)
            .map(|entries| entries.iter().filter(|e| e.min_pk <= pk && pk <= e.max_pk).cloned().collect())
            .unwrap_or_default()
    }

    /// Maximum number of shards simultaneously covering any single PK in
    /// the table's domain.
    pub fn overlap_depth(&self, table_id: u64) -> u32 {
        let tables = self.tables.lock().expect("registry mutex poisoned");
        match tables.get(&table_id) {
            Some(entries) => max_overlap(entries).0,
            None => 0,
        }
    }

    /// When overlap exceeds [`ShardRegistry::overlap_threshold`], the full
    /// set of shards contributing to the maximum-overlap range; otherwise
    /// `None`.
    pub fn compaction_candidates(&self, table_id: u64) -> Option<Vec<ManifestEntry>> {
        let tables = self.tables.lock().expect("registry mutex poisoned");
        let entries = tables.get(&table_id)?;
        let (depth, at) = max_overlap(entries);
        if depth <= self.overlap_threshold {
            return None;
        }
        let at = at?;
        Some(entries.iter().filter(|e| e.min_pk <= at && at <= e.max_pk).cloned().collect())
    }
}

/// The maximum overlap is always attained at some interval endpoint, so it
/// suffices to probe every `min_pk`/`max_pk` rather than sweep the whole
/// (possibly 2^128-sized) PK domain.
fn max_overlap(entries: &[ManifestEntry]) -> (u32, Option<PrimaryKey>) {
    let mut candidates: Vec<PrimaryKey> = entries.iter().flat_map(|e| [e.min_pk, e.max_pk]).collect();
    candidates.sort();
    candidates.dedup();

    let mut best_depth = 0u32;
    let mut best_at = None;
    for pk in candidates {
        let depth = entries.iter().filter(|e| e.min_pk <= pk && pk <= e.max_pk).count() as u32;
        if depth > best_depth {
            best_depth = depth;
            best_at = Some(pk);
        }
    }
    (best_depth, best_at)
}
