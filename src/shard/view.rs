//! Read-only, mmap-backed access to a published shard file. Eagerly
//! validates the PK and weight regions at open; every other region is
//! checksum-verified lazily, on first access.

use super::{ColumnMeta, ShardError, COLUMN_META_SIZE, SHARD_MAGIC, SHARD_VERSION};
use crate::buffer::MappedBuffer;
use crate::checksum::xxh3_of;
use crate::schema::{ColumnValue, PrimaryKey, TableSchema};
use memmap2::Mmap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, OnceLock};

pub struct ShardView {
    mmap: Mmap,
    schema: Arc<TableSchema>,
    row_count: usize,
    pk_meta: ColumnMeta,
    weight_meta: ColumnMeta,
    column_metas: Vec<ColumnMeta>,
    blob_meta: ColumnMeta,
    column_validated: Vec<OnceLock<Result<(), ShardError>>>,
    blob_validated: OnceLock<Result<(), ShardError>>,
}

impl ShardView {
    pub fn open(path: impl AsRef<Path>, schema: Arc<TableSchema>) -> Result<Self, ShardError> {
        let file = File::open(path.as_ref())?;
        // Safety: the shard file is immutable once published; no other
        // writer can mutate it for the lifetime of this mapping.
        let mmap = unsafe { Mmap::map(&file)? };
        let buf = MappedBuffer::new(&mmap);

        let magic = buf.read_u64(0)?;
        if magic != SHARD_MAGIC {
            return Err(ShardError::BadMagic);
        }
        let version = buf.read_u64(8)?;
        if version != SHARD_VERSION {
            return Err(ShardError::UnsupportedVersion(version));
        }
        let row_count = buf.read_u64(16)? as usize;
        let directory_offset = buf.read_u64(24)? as usize;

        let n_cols = schema.payload_column_count();
        let entry_count = 2 + n_cols + 1;
        let dir_bytes = buf.slice(directory_offset, entry_count * COLUMN_META_SIZE)?;

        let pk_meta = ColumnMeta::decode(&dir_bytes[0..COLUMN_META_SIZE]);
        let weight_meta = ColumnMeta::decode(&dir_bytes[COLUMN_META_SIZE..2 * COLUMN_META_SIZE]);
        let mut column_metas = Vec::with_capacity(n_cols);
        for i in 0..n_cols {
            let start = (2 + i) * COLUMN_META_SIZE;
            column_metas.push(ColumnMeta::decode(&dir_bytes[start..start + COLUMN_META_SIZE]));
        }
        let blob_meta = ColumnMeta::decode(&dir_bytes[(2 + n_cols) * COLUMN_META_SIZE..entry_count * COLUMN_META_SIZE]);

        let pk_bytes = buf.slice(pk_meta.offset as usize, pk_meta.size as usize)?;
        if xxh3_of(pk_bytes) != pk_meta.xxh3 {
            return Err(ShardError::ChecksumMismatch { region: "pk" });
        }
        let weight_bytes = buf.slice(weight_meta.offset as usize, weight_meta.size as usize)?;
        if xxh3_of(weight_bytes) != weight_meta.xxh3 {
            return Err(ShardError::ChecksumMismatch { region: "weight" });
        }

        let pk_width = schema.pk_variant().byte_width();
        let mut prev: Option<PrimaryKey> = None;
        for chunk in pk_bytes.chunks_exact(pk_width) {
            let pk = PrimaryKey::from_le_bytes(schema.pk_variant(), chunk);
            if let Some(p) = prev {
                if pk <= p {
                    return Err(ShardError::OutOfOrder);
                }
            }
            prev = Some(pk);
        }
        for chunk in weight_bytes.chunks_exact(8) {
            if i64::from_le_bytes(chunk.try_into().unwrap()) == 0 {
                return Err(ShardError::ZeroWeight);
            }
        }

        let column_validated = (0..n_cols).map(|_| OnceLock::new()).collect();

        Ok(ShardView {
            mmap,
            schema,
            row_count,
            pk_meta,
            weight_meta,
            column_metas,
            blob_meta,
            column_validated,
            blob_validated: OnceLock::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    fn buffer(&self) -> MappedBuffer<'_> {
        MappedBuffer::new(&self.mmap)
    }

    pub fn pk_at(&self, i: usize) -> Result<PrimaryKey, ShardError> {
        let pk_width = self.schema.pk_variant().byte_width();
        let bytes = self.buffer().slice(self.pk_meta.offset as usize + i * pk_width, pk_width)?;
        Ok(PrimaryKey::from_le_bytes(self.schema.pk_variant(), bytes))
    }

    pub fn weight_at(&self, i: usize) -> Result<i64, ShardError> {
        Ok(self.buffer().read_i64(self.weight_meta.offset as usize + i * 8)?)
    }

    /// Binary search over the ascending PK region; returns the half-open
    /// index range of records equal to `pk`.
    pub fn find_pk(&self, pk: PrimaryKey) -> Result<Range<usize>, ShardError> {
        let mut lo = 0usize;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.pk_at(mid)? < pk {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let start = lo;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.pk_at(mid)? <= pk {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(start..lo)
    }

    fn validate_column(&self, pos: usize) -> Result<(), ShardError> {
        let result = self.column_validated[pos].get_or_init(|| {
            let meta = &self.column_metas[pos];
            match self.buffer().slice(meta.offset as usize, meta.size as usize) {
                Ok(bytes) if xxh3_of(bytes) == meta.xxh3 => Ok(()),
                Ok(_) => Err(ShardError::ChecksumMismatch { region: "column" }),
                Err(e) => Err(ShardError::from(e)),
            }
        });
        result.clone()
    }

    fn validate_blob(&self) -> Result<(), ShardError> {
        let result = self.blob_validated.get_or_init(|| {
            match self.buffer().slice(self.blob_meta.offset as usize, self.blob_meta.size as usize) {
                Ok(bytes) if xxh3_of(bytes) == self.blob_meta.xxh3 => Ok(()),
                Ok(_) => Err(ShardError::ChecksumMismatch { region: "blob" }),
                Err(e) => Err(ShardError::from(e)),
            }
        });
        result.clone()
    }

    /// Materializes the packed row payload at index `i` by reading each
    /// column region at its fixed stride offset, then dereferencing the
    /// blob heap for any heap-form string.
    pub fn payload_at(&self, i: usize) -> Result<Vec<ColumnValue>, ShardError> {
        let stride = self.schema.payload_stride();
        let mut packed = vec![0u8; stride];

        for (pos, (idx, col)) in self.schema.payload_columns().enumerate() {
            self.validate_column(pos)?;
            let meta = &self.column_metas[pos];
            let col_stride = col.ty.fixed_size();
            let field = self.buffer().slice(meta.offset as usize + i * col_stride, col_stride)?;
            let off = self.schema.payload_offset(idx)?;
            packed[off..off + col_stride].copy_from_slice(field);
        }

        self.validate_blob()?;
        let blob = self.buffer().slice(self.blob_meta.offset as usize, self.blob_meta.size as usize)?;
        Ok(self.schema.decode_payload(&packed, blob)?)
    }

    pub fn min_pk(&self) -> Result<Option<PrimaryKey>, ShardError> {
        if self.row_count == 0 { Ok(None) } else { self.pk_at(0).map(Some) }
    }

    pub fn max_pk(&self) -> Result<Option<PrimaryKey>, ShardError> {
        if self.row_count == 0 { Ok(None) } else { self.pk_at(self.row_count - 1).map(Some) }
    }
}

impl Clone for ShardError {
    fn clone(&self) -> Self {
        // OnceLock caching needs a cheap clone; errors carry only copyable
        // or small owned data so a textual round-trip is unnecessary here.
        match self {
            ShardError::Io(e) => ShardError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ShardError::Schema(e) => ShardError::Schema(e.clone()),
            ShardError::Bounds(e) => ShardError::Bounds(e.clone()),
            ShardError::BadMagic => ShardError::BadMagic,
            ShardError::UnsupportedVersion(v) => ShardError::UnsupportedVersion(*v),
            ShardError::ChecksumMismatch { region } => ShardError::ChecksumMismatch { region },
            ShardError::OutOfOrder => ShardError::OutOfOrder,
            ShardError::ZeroWeight => ShardError::ZeroWeight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use crate::schema::{ColumnDef, ColumnType, PkVariant};
    use crate::shard::ShardWriter;
    use tempfile::tempdir;

    fn schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            1,
            PkVariant::U64,
            vec![
                ColumnDef::new("pk", ColumnType::U64),
                ColumnDef::new("n", ColumnType::I64),
                ColumnDef::new("s", ColumnType::Str),
            ],
            0,
        ))
    }

    #[test]
    fn round_trips_rows_through_writer_and_view() {
        let schema = schema();
        let mut table = Memtable::new(schema.clone(), 1 << 16);
        table
            .upsert(PrimaryKey::U64(1), &[ColumnValue::I64(10), ColumnValue::Str(b"a".to_vec())], 2, 1)
            .unwrap();
        table
            .upsert(
                PrimaryKey::U64(5),
                &[ColumnValue::I64(20), ColumnValue::Str(b"a string long enough to live on the heap".to_vec())],
                7,
                2,
            )
            .unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("a.shard");
        ShardWriter::write(&path, &table).unwrap();

        let view = ShardView::open(&path, schema).unwrap();
        assert_eq!(view.len(), 2);
        assert_eq!(view.pk_at(0).unwrap(), PrimaryKey::U64(1));
        assert_eq!(view.weight_at(0).unwrap(), 2);
        assert_eq!(view.payload_at(1).unwrap()[1], ColumnValue::Str(b"a string long enough to live on the heap".to_vec()));
        assert_eq!(view.min_pk().unwrap(), Some(PrimaryKey::U64(1)));
        assert_eq!(view.max_pk().unwrap(), Some(PrimaryKey::U64(5)));
    }

    #[test]
    fn find_pk_returns_half_open_range_for_duplicates() {
        let schema = schema();
        let mut table = Memtable::new(schema.clone(), 1 << 16);
        table.upsert(PrimaryKey::U64(1), &[ColumnValue::I64(1), ColumnValue::Str(b"a".to_vec())], 1, 1).unwrap();
        table.upsert(PrimaryKey::U64(1), &[ColumnValue::I64(2), ColumnValue::Str(b"b".to_vec())], 1, 2).unwrap();
        table.upsert(PrimaryKey::U64(2), &[ColumnValue::I64(3), ColumnValue::Str(b"c".to_vec())], 1, 3).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("a.shard");
        ShardWriter::write(&path, &table).unwrap();
        let view = ShardView::open(&path, schema).unwrap();

        assert_eq!(view.find_pk(PrimaryKey::U64(1)).unwrap(), 0..2);
        assert_eq!(view.find_pk(PrimaryKey::U64(2)).unwrap(), 2..3);
        assert_eq!(view.find_pk(PrimaryKey::U64(99)).unwrap(), 3..3);
    }
}
