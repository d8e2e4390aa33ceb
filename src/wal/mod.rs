//! Write-ahead log: append-only sequence of LSN-prefixed batch blocks.
//!
//! Durability contract: `append` does not return until the block is
//! `fsync`-persisted (unless the caller has explicitly opted out for tests
//! via `wal_fsync`). Replay verifies each block's checksum and truncates the
//! file at the first invalid block.
//!
//! # On-disk layout
//!
//! ```text
//! [BLOCK][BLOCK]...
//! ```
//!
//! Each block is a 32-byte header followed by a variable-length body:
//!
//! ```text
//! header: lsn(8) | table_id(4) | entry_count(4) | body_xxh3(8) | reserved(8)
//! body:   record*
//! record: pk(8|16) | weight(8) | packed_row(stride) | heap_section?
//! ```
//!
//! `heap_section` holds, for every payload column that is a heap-form German
//! string (in column declaration order), a VarInt length followed by that
//! many string bytes. The offset stored in the string's 16-byte struct is the
//! byte offset of its VarInt, measured from the start of the record's own
//! heap section — never from the start of the block.

use crate::checksum::{VarIntError, read_varint, write_varint, xxh3_of};
use crate::schema::{ColumnType, ColumnValue, GermanString, PrimaryKey, SchemaError, TableSchema, Weight, GSTRING_SIZE};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

const BLOCK_HEADER_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum WalError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    VarInt(#[from] VarIntError),
    #[error("wal block body is malformed or truncated")]
    Malformed,
    #[error("another writer holds the wal lock")]
    WALLocked,
}

/// One Z-Set delta inside a block.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub pk: PrimaryKey,
    pub payload: Vec<ColumnValue>,
    pub weight: Weight,
}

/// A decoded, checksum-verified block.
#[derive(Debug, Clone)]
pub struct WalBlock {
    pub lsn: u64,
    pub table_id: u32,
    pub entries: Vec<WalEntry>,
}

pub struct Wal {
    file: File,
    path: PathBuf,
    schema: Arc<TableSchema>,
    fsync: bool,
}

impl Wal {
    /// Opens (creating if absent) the WAL file at `path` and acquires an
    /// exclusive advisory lock, enforcing the single-writer discipline.
    pub fn open(path: impl AsRef<Path>, schema: Arc<TableSchema>, fsync: bool) -> Result<Self, WalError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        file.try_lock_exclusive().map_err(|_| WalError::WALLocked)?;

        if !fsync {
            warn!(path = %path.display(), "wal opened with fsync disabled; test-only, forbidden in production");
        }

        Ok(Wal { file, path: path.to_path_buf(), schema, fsync })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one block, durably persisting it before returning (unless
    /// `fsync` was disabled at open).
    pub fn append(&mut self, lsn: u64, table_id: u32, entries: &[WalEntry]) -> Result<(), WalError> {
        let body = encode_body(&self.schema, entries)?;
        let body_xxh3 = xxh3_of(&body);

        let mut header = [0u8; BLOCK_HEADER_SIZE];
        header[0..8].copy_from_slice(&lsn.to_le_bytes());
        header[8..12].copy_from_slice(&table_id.to_le_bytes());
        header[12..16].copy_from_slice(&(entries.len() as u32).to_le_bytes());
        header[16..24].copy_from_slice(&body_xxh3.to_le_bytes());

        self.file.write_all(&header)?;
        self.file.write_all(&body)?;
        if self.fsync {
            self.file.sync_all()?;
        }

        trace!(lsn, table_id, entries = entries.len(), "wal block appended");
        Ok(())
    }

    /// Replays every well-formed, checksum-valid block from the start of the
    /// file. Stops at the first invalid or partially-written block and
    /// truncates the file there.
    pub fn replay(&mut self) -> Result<Vec<WalBlock>, WalError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        self.file.read_to_end(&mut buf)?;

        let mut blocks = Vec::new();
        let mut pos = 0usize;

        loop {
            if buf.len() - pos < BLOCK_HEADER_SIZE {
                break;
            }
            let header = &buf[pos..pos + BLOCK_HEADER_SIZE];
            let lsn = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let table_id = u32::from_le_bytes(header[8..12].try_into().unwrap());
            let entry_count = u32::from_le_bytes(header[12..16].try_into().unwrap());
            let body_xxh3 = u64::from_le_bytes(header[16..24].try_into().unwrap());

            let body_start = pos + BLOCK_HEADER_SIZE;
            match decode_body(&self.schema, &buf[body_start..], entry_count) {
                Ok((entries, consumed)) => {
                    let body = &buf[body_start..body_start + consumed];
                    if xxh3_of(body) != body_xxh3 {
                        warn!(lsn, "wal block checksum mismatch; truncating replay here");
                        break;
                    }
                    pos = body_start + consumed;
                    blocks.push(WalBlock { lsn, table_id, entries });
                }
                Err(_) => {
                    warn!(lsn, "wal block body truncated or malformed; truncating replay here");
                    break;
                }
            }
        }

        if pos < buf.len() {
            let recovered_to_lsn = blocks.last().map(|b| b.lsn);
            warn!(?recovered_to_lsn, discarded_bytes = buf.len() - pos, "wal truncated at first invalid block");
            self.file.set_len(pos as u64)?;
            self.file.seek(SeekFrom::End(0))?;
        }

        Ok(blocks)
    }

    /// Discards every block and leaves an empty file, used after a
    /// successful flush has made the whole WAL redundant.
    pub fn truncate_all(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        if self.fsync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn encode_body(schema: &TableSchema, entries: &[WalEntry]) -> Result<Vec<u8>, SchemaError> {
    let mut body = Vec::new();
    for entry in entries {
        body.extend_from_slice(&entry.pk.to_le_bytes_vec());
        body.extend_from_slice(&entry.weight.to_le_bytes());

        let mut heap = Vec::new();
        let packed = schema.encode_payload(&entry.payload, |bytes| {
            let off = heap.len() as u64;
            write_varint(bytes.len() as u64, &mut heap);
            heap.extend_from_slice(bytes);
            off
        })?;
        body.extend_from_slice(&packed);
        body.extend_from_slice(&heap);
    }
    Ok(body)
}

/// Decodes `entry_count` records from the front of `body`, returning the
/// entries and the number of bytes consumed. Any structural problem
/// (truncation, malformed VarInt) is reported uniformly as [`WalError`] so
/// the caller can treat it as "stop replaying here".
fn decode_body(schema: &TableSchema, body: &[u8], entry_count: u32) -> Result<(Vec<WalEntry>, usize), WalError> {
    let pk_width = schema.pk_variant().byte_width();
    let stride = schema.payload_stride();
    let mut cursor = 0usize;
    let mut entries = Vec::with_capacity(entry_count as usize);

    for _ in 0..entry_count {
        let pk_bytes = body.get(cursor..cursor + pk_width).ok_or(WalError::Malformed)?;
        let pk = PrimaryKey::from_le_bytes(schema.pk_variant(), pk_bytes);
        cursor += pk_width;

        let weight_bytes = body.get(cursor..cursor + 8).ok_or(WalError::Malformed)?;
        let weight = i64::from_le_bytes(weight_bytes.try_into().unwrap());
        cursor += 8;

        let packed = body.get(cursor..cursor + stride).ok_or(WalError::Malformed)?;
        cursor += stride;

        let heap_start = cursor;
        for (idx, col) in schema.payload_columns() {
            if col.ty != ColumnType::Str {
                continue;
            }
            let off = schema.payload_offset(idx)?;
            let raw: [u8; GSTRING_SIZE] = packed[off..off + GSTRING_SIZE].try_into().unwrap();
            if GermanString::decode(&raw).is_heap() {
                let (len, n) = read_varint(body.get(cursor..).ok_or(WalError::Malformed)?)?;
                cursor += n;
                if body.len() < cursor + len as usize {
                    return Err(WalError::Malformed);
                }
                cursor += len as usize;
            }
        }

        let payload = schema.decode_payload(packed, &body[heap_start..])?;
        entries.push(WalEntry { pk, payload, weight });
    }

    Ok((entries, cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnValue, PkVariant};
    use tempfile::tempdir;

    fn schema_with_string() -> Arc<TableSchema> {
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

    fn entry(pk: u64, n: i64, s: &[u8], weight: Weight) -> WalEntry {
        WalEntry {
            pk: PrimaryKey::U64(pk),
            payload: vec![ColumnValue::I64(n), ColumnValue::Str(s.to_vec())],
            weight,
        }
    }

    #[test]
    fn append_then_replay_round_trips_with_long_strings() {
        let dir = tempdir().unwrap();
        let schema = schema_with_string();
        let mut wal = Wal::open(dir.path().join("WAL"), schema, true).unwrap();

        let short = entry(1, 10, b"hi", 1);
        let long = entry(2, 20, b"this string is long enough to force heap storage", -3);
        wal.append(1, 7, &[short.clone(), long.clone()]).unwrap();
        wal.append(2, 7, &[entry(3, 30, b"another", 5)]).unwrap();

        let blocks = wal.replay().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].lsn, 1);
        assert_eq!(blocks[0].entries, vec![short, long]);
        assert_eq!(blocks[1].lsn, 2);
    }

    #[test]
    fn replay_truncates_at_corrupted_trailing_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("WAL");
        let schema = schema_with_string();
        {
            let mut wal = Wal::open(&path, schema.clone(), true).unwrap();
            wal.append(1, 7, &[entry(1, 1, b"a", 1)]).unwrap();
            wal.append(2, 7, &[entry(2, 2, b"b", 1)]).unwrap();
        }

        let valid_len = std::fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            let mut bogus_header = [0u8; BLOCK_HEADER_SIZE];
            bogus_header[0..8].copy_from_slice(&3u64.to_le_bytes());
            bogus_header[12..16].copy_from_slice(&1u32.to_le_bytes());
            bogus_header[16..24].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
            f.write_all(&bogus_header).unwrap();
            f.write_all(&[0u8; 8 + 8 + 24]).unwrap(); // pk + weight + stride, wrong checksum
            f.sync_all().unwrap();
        }

        let mut wal = Wal::open(&path, schema, true).unwrap();
        let blocks = wal.replay().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), valid_len);
    }

    #[test]
    fn second_open_without_closing_first_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("WAL");
        let schema = schema_with_string();
        let _first = Wal::open(&path, schema.clone(), true).unwrap();
        let second = Wal::open(&path, schema, true);
        assert!(matches!(second, Err(WalError::WALLocked)));
    }

    #[test]
    fn truncate_all_empties_the_file() {
        let dir = tempdir().unwrap();
        let schema = schema_with_string();
        let mut wal = Wal::open(dir.path().join("WAL"), schema, true).unwrap();
        wal.append(1, 7, &[entry(1, 1, b"a", 1)]).unwrap();
        wal.truncate_all().unwrap();
        assert!(wal.replay().unwrap().is_empty());
    }
}
