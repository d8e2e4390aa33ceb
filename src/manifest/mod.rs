//! Atomic on-disk catalog of a table's active shard set.
//!
//! Unlike a WAL-driven metadata store, this manifest has no event log: every
//! mutation (flush, compaction) replaces the whole entry set in one shot and
//! publishes it with the same tmp-file + fsync + rename + fsync-parent-dir
//! idiom used for shard files.

use crate::checksum::xxh3_of;
use crate::schema::{PkVariant, PrimaryKey};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

pub const MANIFEST_FILENAME: &str = "MANIFNGT";
const MAGIC: u64 = 0x4D41_4E49_464E_4754;
const VERSION: u64 = 1;
const HEADER_SIZE: usize = 32;
const TRAILER_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("manifest header magic mismatch")]
    BadMagic,
    #[error("unsupported manifest format version {0}")]
    UnsupportedVersion(u64),
    #[error("manifest file is truncated")]
    Truncated,
    #[error("manifest entry checksum mismatch")]
    EntryChecksumMismatch,
    #[error("manifest trailer checksum mismatch")]
    TrailerChecksumMismatch,
    #[error("shard path {0:?} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("shard path {0:?} exceeds the 65535-byte manifest path limit")]
    PathTooLong(PathBuf),
}

/// One shard admitted to a table's active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub table_id: u64,
    pub path: PathBuf,
    pub pk_variant: PkVariant,
    pub min_pk: PrimaryKey,
    pub max_pk: PrimaryKey,
    pub min_lsn: u64,
    pub max_lsn: u64,
    pub schema_hash: u64,
}

impl ManifestEntry {
    fn encode(&self) -> Result<Vec<u8>, ManifestError> {
        let path_str = self.path.to_str().ok_or_else(|| ManifestError::NonUtf8Path(self.path.clone()))?;
        let path_bytes = path_str.as_bytes();
        if path_bytes.len() > u16::MAX as usize {
            return Err(ManifestError::PathTooLong(self.path.clone()));
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&self.table_id.to_le_bytes());
        buf.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(path_bytes);
        buf.push(self.pk_variant.tag());
        buf.extend_from_slice(&self.min_pk.to_le_bytes_vec());
        buf.extend_from_slice(&self.max_pk.to_le_bytes_vec());
        buf.extend_from_slice(&self.min_lsn.to_le_bytes());
        buf.extend_from_slice(&self.max_lsn.to_le_bytes());
        buf.extend_from_slice(&self.schema_hash.to_le_bytes());

        let checksum = xxh3_of(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one entry from the front of `buf`, returning it and the
    /// number of bytes consumed.
    fn decode(buf: &[u8]) -> Result<(Self, usize), ManifestError> {
        let mut cursor = 0usize;
        let read = |cursor: &mut usize, n: usize| -> Result<&[u8], ManifestError> {
            let slice = buf.get(*cursor..*cursor + n).ok_or(ManifestError::Truncated)?;
            *cursor += n;
            Ok(slice)
        };

        let table_id = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let path_len = u16::from_le_bytes(read(&mut cursor, 2)?.try_into().unwrap()) as usize;
        let path_bytes = read(&mut cursor, path_len)?.to_vec();
        let path = PathBuf::from(String::from_utf8(path_bytes).map_err(|_| ManifestError::Truncated)?);
        let pk_variant = PkVariant::from_tag(read(&mut cursor, 1)?[0]).ok_or(ManifestError::Truncated)?;
        let pk_width = pk_variant.byte_width();
        let min_pk = PrimaryKey::from_le_bytes(pk_variant, read(&mut cursor, pk_width)?);
        let max_pk = PrimaryKey::from_le_bytes(pk_variant, read(&mut cursor, pk_width)?);
        let min_lsn = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let max_lsn = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        let schema_hash = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());

        let body_end = cursor;
        let stored_xxh3 = u64::from_le_bytes(read(&mut cursor, 8)?.try_into().unwrap());
        if xxh3_of(&buf[..body_end]) != stored_xxh3 {
            return Err(ManifestError::EntryChecksumMismatch);
        }

        Ok((
            ManifestEntry { table_id, path, pk_variant, min_pk, max_pk, min_lsn, max_lsn, schema_hash },
            cursor,
        ))
    }
}

struct ManifestState {
    global_max_lsn: u64,
    entries: Vec<ManifestEntry>,
}

/// Persistent, atomically-swapped catalog of a table's live shards. The
/// engine is the sole writer; readers reload by calling [`Manifest::open`]
/// again or, in-process, by going through the same handle.
pub struct Manifest {
    dir: PathBuf,
    state: Mutex<ManifestState>,
}

impl Manifest {
    /// Loads `<dir>/MANIFNGT`, or starts empty if it doesn't exist yet.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(MANIFEST_FILENAME);

        let state = if path.exists() {
            let bytes = fs::read(&path)?;
            decode_manifest(&bytes)?
        } else {
            ManifestState { global_max_lsn: 0, entries: Vec::new() }
        };

        Ok(Manifest { dir, state: Mutex::new(state) })
    }

    pub fn global_max_lsn(&self) -> u64 {
        self.state.lock().expect("manifest mutex poisoned").global_max_lsn
    }

    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.state.lock().expect("manifest mutex poisoned").entries.clone()
    }

    pub fn entries_for_table(&self, table_id: u64) -> Vec<ManifestEntry> {
        self.entries().into_iter().filter(|e| e.table_id == table_id).collect()
    }

    /// Atomically replaces the full entry set and `global_max_lsn` via the
    /// tmp+fsync+rename swap model. Used both by `flush` (adds one shard)
    /// and by compaction (removes inputs, adds the merged output).
    pub fn swap(&self, entries: Vec<ManifestEntry>, global_max_lsn: u64) -> Result<(), ManifestError> {
        let bytes = encode_manifest(&entries, global_max_lsn)?;
        publish(&self.dir, &bytes)?;

        let mut state = self.state.lock().expect("manifest mutex poisoned");
        state.entries = entries;
        state.global_max_lsn = global_max_lsn;
        info!(entry_count = state.entries.len(), global_max_lsn, "manifest swapped");
        Ok(())
    }
}

fn encode_manifest(entries: &[ManifestEntry], global_max_lsn: u64) -> Result<Vec<u8>, ManifestError> {
    let mut out = Vec::with_capacity(HEADER_SIZE + entries.len() * 64 + TRAILER_SIZE);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&global_max_lsn.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u64).to_le_bytes());

    for entry in entries {
        out.extend_from_slice(&entry.encode()?);
    }

    let file_xxh3 = xxh3_of(&out);
    out.extend_from_slice(&file_xxh3.to_le_bytes());
    Ok(out)
}

fn decode_manifest(buf: &[u8]) -> Result<ManifestState, ManifestError> {
    if buf.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(ManifestError::Truncated);
    }
    let body_end = buf.len() - TRAILER_SIZE;
    let stored_xxh3 = u64::from_le_bytes(buf[body_end..].try_into().unwrap());
    if xxh3_of(&buf[..body_end]) != stored_xxh3 {
        return Err(ManifestError::TrailerChecksumMismatch);
    }

    let magic = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    if magic != MAGIC {
        return Err(ManifestError::BadMagic);
    }
    let version = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    if version != VERSION {
        return Err(ManifestError::UnsupportedVersion(version));
    }
    let global_max_lsn = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let entry_count = u64::from_le_bytes(buf[24..32].try_into().unwrap()) as usize;

    let mut entries = Vec::with_capacity(entry_count);
    let mut cursor = HEADER_SIZE;
    for _ in 0..entry_count {
        let (entry, consumed) = ManifestEntry::decode(&buf[cursor..body_end])?;
        cursor += consumed;
        entries.push(entry);
    }

    Ok(ManifestState { global_max_lsn, entries })
}

fn publish(dir: &Path, bytes: &[u8]) -> Result<(), ManifestError> {
    let final_path = dir.join(MANIFEST_FILENAME);
    let tmp_path = dir.join(format!("{}.tmp", MANIFEST_FILENAME));
    {
        let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;
    fsync_dir(dir)?;
    Ok(())
}

fn fsync_dir(dir: &Path) -> Result<(), ManifestError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
