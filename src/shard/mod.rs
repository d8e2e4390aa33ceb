//! Immutable, mmap-friendly columnar shard format ("N-Partition"): a
//! transmuted, sealed MemTable laid out as dense per-column regions plus a
//! shared blob heap. See [`writer`] for construction and [`view`] for
//! read-only access.

mod view;
mod writer;

pub use view::ShardView;
pub use writer::ShardWriter;

use crate::buffer::BufferError;
use crate::schema::SchemaError;
use thiserror::Error;

pub const SHARD_MAGIC: u64 = 0x31305F5A_54494E47;
pub const SHARD_VERSION: u64 = 2;
pub const HEADER_SIZE: usize = 64;
pub const COLUMN_META_SIZE: usize = 24;
pub const REGION_ALIGN: usize = 64;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Bounds(#[from] BufferError),
    #[error("shard header magic mismatch")]
    BadMagic,
    #[error("unsupported shard format version {0}")]
    UnsupportedVersion(u64),
    #[error("checksum mismatch in shard region {region}")]
    ChecksumMismatch { region: &'static str },
    #[error("primary key region is not strictly ascending")]
    OutOfOrder,
    #[error("weight region contains a zero weight")]
    ZeroWeight,
}

/// One column-directory entry: a region's location and its independently
/// verifiable checksum.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMeta {
    pub offset: u64,
    pub size: u64,
    pub xxh3: u64,
}

impl ColumnMeta {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..24].copy_from_slice(&self.xxh3.to_le_bytes());
    }

    pub fn decode(raw: &[u8]) -> Self {
        ColumnMeta {
            offset: u64::from_le_bytes(raw[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            xxh3: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
        }
    }
}

/// Rounds `offset` up to the next multiple of [`REGION_ALIGN`].
pub(crate) fn align_up(offset: usize) -> usize {
    (offset + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}
