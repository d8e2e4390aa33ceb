//! Transmutes a sealed MemTable into an immutable shard file, staged
//! entirely in memory and then published via tmp-file + fsync + rename +
//! fsync-parent-dir.

use super::{align_up, ColumnMeta, ShardError, COLUMN_META_SIZE, HEADER_SIZE, SHARD_MAGIC, SHARD_VERSION};
use crate::checksum::xxh3_of;
use crate::memtable::Memtable;
use crate::schema::{ColumnValue, PrimaryKey, TableSchema, Weight};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

pub struct ShardWriter;

impl ShardWriter {
    /// Writes every non-annihilated `(pk, payload)` in `table` to a new
    /// shard file at `path`. Returns `None` (and writes nothing) if every
    /// node in the MemTable is at net-zero weight.
    pub fn write(path: impl AsRef<Path>, table: &Memtable) -> Result<Option<()>, ShardError> {
        let schema = table.schema().clone();
        let rows = table.cursor_ascending().filter(|row| row.weight != 0).map(|row| Ok((row.pk, row.payload, row.weight)));
        Self::write_rows(path, &schema, rows)
    }

    /// Writes an already-ordered, already-annihilated `(pk, payload, weight)`
    /// stream to a new shard file. Shared by [`Self::write`] (MemTable
    /// transmutation) and the compactor (merged shard output) — both stage
    /// the same way, only the row source differs.
    pub fn write_rows(
        path: impl AsRef<Path>,
        schema: &TableSchema,
        rows: impl Iterator<Item = Result<(PrimaryKey, Vec<ColumnValue>, Weight), ShardError>>,
    ) -> Result<Option<()>, ShardError> {
        let payload_cols: Vec<_> = schema.payload_columns().collect();

        let mut pk_region = Vec::new();
        let mut weight_region = Vec::new();
        let mut column_regions: Vec<Vec<u8>> = vec![Vec::new(); payload_cols.len()];
        let mut blob_heap = Vec::new();
        let mut blob_dedup: HashMap<Vec<u8>, u64> = HashMap::new();
        let mut row_count: u64 = 0;

        for row in rows {
            let (pk, payload, weight) = row?;
            if weight == 0 {
                continue;
            }
            pk_region.extend_from_slice(&pk.to_le_bytes_vec());
            weight_region.extend_from_slice(&weight.to_le_bytes());

            let packed = schema.encode_payload(&payload, |bytes| {
                if let Some(&off) = blob_dedup.get(bytes) {
                    return off;
                }
                let off = blob_heap.len() as u64;
                blob_heap.extend_from_slice(bytes);
                blob_dedup.insert(bytes.to_vec(), off);
                off
            })?;

            for (pos, (idx, col)) in payload_cols.iter().enumerate() {
                let off = schema.payload_offset(*idx)?;
                let stride = col.ty.fixed_size();
                column_regions[pos].extend_from_slice(&packed[off..off + stride]);
            }
            row_count += 1;
        }

        if row_count == 0 {
            debug!("shard write skipped: no surviving rows");
            return Ok(None);
        }

        let bytes = build_shard_bytes(schema, row_count, &pk_region, &weight_region, &column_regions, &blob_heap);
        publish(path.as_ref(), &bytes)?;
        info!(row_count, path = %path.as_ref().display(), "shard published");
        Ok(Some(()))
    }
}

fn build_shard_bytes(
    schema: &TableSchema,
    row_count: u64,
    pk_region: &[u8],
    weight_region: &[u8],
    column_regions: &[Vec<u8>],
    blob_heap: &[u8],
) -> Vec<u8> {
    let entry_count = 2 + column_regions.len() + 1;
    let directory_size = entry_count * COLUMN_META_SIZE;
    let directory_offset = HEADER_SIZE; // header is itself 64-byte aligned

    let mut cursor = align_up(directory_offset + directory_size);
    let pk_offset = cursor;
    cursor = align_up(pk_offset + pk_region.len());
    let weight_offset = cursor;
    cursor = align_up(weight_offset + weight_region.len());

    let mut column_offsets = Vec::with_capacity(column_regions.len());
    for region in column_regions {
        column_offsets.push(cursor);
        cursor = align_up(cursor + region.len());
    }
    let blob_offset = cursor;
    let file_size = blob_offset + blob_heap.len();

    let mut out = vec![0u8; file_size];

    out[0..8].copy_from_slice(&SHARD_MAGIC.to_le_bytes());
    out[8..16].copy_from_slice(&SHARD_VERSION.to_le_bytes());
    out[16..24].copy_from_slice(&row_count.to_le_bytes());
    out[24..32].copy_from_slice(&(directory_offset as u64).to_le_bytes());
    out[32..40].copy_from_slice(&schema.table_id().to_le_bytes());
    // bytes 40..64 reserved, already zeroed.

    let mut metas = Vec::with_capacity(entry_count);
    metas.push(ColumnMeta { offset: pk_offset as u64, size: pk_region.len() as u64, xxh3: xxh3_of(pk_region) });
    metas.push(ColumnMeta {
        offset: weight_offset as u64,
        size: weight_region.len() as u64,
        xxh3: xxh3_of(weight_region),
    });
    for (region, &offset) in column_regions.iter().zip(column_offsets.iter()) {
        metas.push(ColumnMeta { offset: offset as u64, size: region.len() as u64, xxh3: xxh3_of(region) });
    }
    metas.push(ColumnMeta { offset: blob_offset as u64, size: blob_heap.len() as u64, xxh3: xxh3_of(blob_heap) });

    let mut dir_cursor = directory_offset;
    for meta in &metas {
        meta.encode(&mut out[dir_cursor..dir_cursor + COLUMN_META_SIZE]);
        dir_cursor += COLUMN_META_SIZE;
    }

    out[pk_offset..pk_offset + pk_region.len()].copy_from_slice(pk_region);
    out[weight_offset..weight_offset + weight_region.len()].copy_from_slice(weight_region);
    for (region, &offset) in column_regions.iter().zip(column_offsets.iter()) {
        out[offset..offset + region.len()].copy_from_slice(region);
    }
    out[blob_offset..blob_offset + blob_heap.len()].copy_from_slice(blob_heap);

    out
}

fn publish(final_path: &Path, bytes: &[u8]) -> Result<(), ShardError> {
    let tmp_path = final_path.with_extension("shard.tmp");
    {
        let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, final_path)?;
    if let Some(dir) = final_path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
