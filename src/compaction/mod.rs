//! Pure Z-Set merge compaction: merges a table's overlapping
//! shards into one, summing weights per `(pk, payload)` group and dropping
//! any group whose net weight lands on zero — the "Ghost Property". No
//! last-write-wins, no tombstones; weight *is* the only mutation record.

use std::cell::Cell;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::manifest::{Manifest, ManifestEntry, ManifestError};
use crate::refcounter::{RefCounter, RefCounterError};
use crate::registry::ShardRegistry;
use crate::schema::{add_weight, compare_column_values, ColumnValue, PrimaryKey, SchemaError, TableSchema, Weight};
use crate::shard::{ShardError, ShardView, ShardWriter};
use crate::tournament::{ShardCursor, TournamentTree};

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    RefCounter(#[from] RefCounterError),
}

/// One completed compaction round: the shard that replaced `removed`.
pub struct CompactionOutcome {
    pub published: Option<ManifestEntry>,
    pub removed: Vec<ManifestEntry>,
}

/// Runs one compaction round for `table_id`, if the registry currently
/// holds a candidate set above the overlap threshold. `table_dir` is the
/// table's root directory; merged output lands under `table_dir/shards/`.
///
/// Consults the registry, merges, writes the output shard, swaps the
/// manifest, and updates the registry and refcounter in place. Returns
/// `Ok(None)` if there is nothing to compact right now.
pub fn maybe_compact(
    schema: &Arc<TableSchema>,
    manifest: &Manifest,
    registry: &ShardRegistry,
    refcounter: &RefCounter,
    table_dir: impl AsRef<Path>,
) -> Result<Option<CompactionOutcome>, CompactionError> {
    let table_id = schema.table_id();
    let Some(inputs) = registry.compaction_candidates(table_id) else {
        return Ok(None);
    };
    let outcome = compact(schema, manifest, refcounter, &inputs, table_dir)?;

    let remaining = manifest.entries_for_table(table_id);
    registry.refresh(table_id, remaining);

    for input in &outcome.removed {
        refcounter.mark_for_delete(&input.path)?;
        refcounter.release(&input.path)?;
    }

    info!(table_id, removed = outcome.removed.len(), "compaction round complete");
    Ok(Some(outcome))
}

/// Merges `inputs` (all belonging to `schema.table_id()`) into one shard
/// and publishes the result through the manifest. Does not touch the
/// registry or refcounter bookkeeping beyond acquiring inputs for the
/// duration of the merge — see [`maybe_compact`] for the full lifecycle.
fn compact(
    schema: &Arc<TableSchema>,
    manifest: &Manifest,
    refcounter: &RefCounter,
    inputs: &[ManifestEntry],
    table_dir: impl AsRef<Path>,
) -> Result<CompactionOutcome, CompactionError> {
    let table_dir = table_dir.as_ref();
    for entry in inputs {
        refcounter.acquire(table_dir.join(&entry.path));
    }
    let result = compact_merge(schema, manifest, inputs, table_dir);
    for entry in inputs {
        let _ = refcounter.release(table_dir.join(&entry.path));
    }
    result
}

fn compact_merge(
    schema: &Arc<TableSchema>,
    manifest: &Manifest,
    inputs: &[ManifestEntry],
    table_dir: &Path,
) -> Result<CompactionOutcome, CompactionError> {
    let table_id = schema.table_id();

    let views: Vec<ShardView> =
        inputs.iter().map(|entry| ShardView::open(table_dir.join(&entry.path), schema.clone())).collect::<Result<_, _>>()?;
    let cursors: Vec<ShardCursor<'_>> = views.iter().map(ShardCursor::new).collect::<Result<_, _>>()?;
    let tree = TournamentTree::new(cursors);

    let min_pk = Cell::new(None::<PrimaryKey>);
    let max_pk = Cell::new(None::<PrimaryKey>);
    let rows = GroupedMerge::new(tree)?.inspect(|row| {
        if let Ok((pk, _, _)) = row {
            if min_pk.get().is_none() {
                min_pk.set(Some(*pk));
            }
            max_pk.set(Some(*pk));
        }
    });

    let shards_dir = table_dir.join("shards");
    fs::create_dir_all(&shards_dir)?;
    let rel_path = PathBuf::from("shards").join(format!("{}.shard", Uuid::new_v4()));
    let out_path = table_dir.join(&rel_path);

    let written = match ShardWriter::write_rows(&out_path, schema, rows) {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(out_path.with_extension("shard.tmp"));
            return Err(e.into());
        }
    };

    let input_min_lsn = inputs.iter().map(|e| e.min_lsn).min().unwrap_or(0);
    let input_max_lsn = inputs.iter().map(|e| e.max_lsn).max().unwrap_or(0);

    let published = written.map(|()| ManifestEntry {
        table_id,
        path: rel_path,
        pk_variant: schema.pk_variant(),
        min_pk: min_pk.get().expect("write_rows returned Some with no rows tracked"),
        max_pk: max_pk.get().expect("write_rows returned Some with no rows tracked"),
        min_lsn: input_min_lsn,
        max_lsn: input_max_lsn,
        schema_hash: schema.schema_hash(),
    });

    let mut new_entries: Vec<ManifestEntry> = manifest.entries().into_iter().filter(|e| !inputs.iter().any(|i| i.path == e.path)).collect();
    if let Some(entry) = &published {
        new_entries.push(entry.clone());
    }
    let new_global_max_lsn = manifest.global_max_lsn().max(input_max_lsn);

    if let Err(e) = manifest.swap(new_entries, new_global_max_lsn) {
        if published.is_some() {
            let _ = fs::remove_file(&out_path);
        }
        return Err(e.into());
    }

    Ok(CompactionOutcome { published, removed: inputs.to_vec() })
}

/// Groups a tournament tree's ascending `(pk, payload)` stream into runs of
/// full-row equality, summing weight per run and discarding zero-sum runs.
/// Equal `(pk, payload)` records are always adjacent in the tree's output,
/// so this is a single forward pass with one row of lookahead.
struct GroupedMerge<'a> {
    inner: TournamentTree<'a>,
    peeked: Option<(PrimaryKey, Vec<ColumnValue>, Weight)>,
}

impl<'a> GroupedMerge<'a> {
    fn new(mut inner: TournamentTree<'a>) -> Result<Self, ShardError> {
        let peeked = inner.next().transpose()?;
        Ok(GroupedMerge { inner, peeked })
    }
}

impl<'a> Iterator for GroupedMerge<'a> {
    type Item = Result<(PrimaryKey, Vec<ColumnValue>, Weight), ShardError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (pk, payload, mut weight) = self.peeked.take()?;
        loop {
            match self.inner.next() {
                None => {
                    self.peeked = None;
                    break;
                }
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok((next_pk, next_payload, next_weight))) => {
                    if next_pk == pk && compare_column_values(&next_payload, &payload) == Ordering::Equal {
                        weight = match add_weight(weight, next_weight) {
                            Ok(w) => w,
                            Err(e) => return Some(Err(e.into())),
                        };
                    } else {
                        self.peeked = Some((next_pk, next_payload, next_weight));
                        break;
                    }
                }
            }
        }

        if weight == 0 {
            self.next()
        } else {
            Some(Ok((pk, payload, weight)))
        }
    }
}
