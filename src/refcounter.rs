//! Process-local shard lifetime tracking.
//!
//! The compactor acquires its input shards before reading them; the engine
//! marks superseded inputs for deletion once the manifest swap that drops
//! them is durable. The physical file is unlinked the moment both
//! conditions hold, regardless of which happens last.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RefCounterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Entry {
    count: u64,
    marked_for_delete: bool,
}

/// Keyed by canonical shard path; falls back to the path as given if the
/// file can't be canonicalized (e.g. it was already unlinked).
pub struct RefCounter {
    table: Mutex<HashMap<PathBuf, Entry>>,
}

impl RefCounter {
    pub fn new() -> Self {
        RefCounter { table: Mutex::new(HashMap::new()) }
    }

    fn canonical_key(path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    /// Increments the reference count for `path`. Called by every reader at
    /// mapping time.
    pub fn acquire(&self, path: impl AsRef<Path>) {
        let key = Self::canonical_key(path.as_ref());
        let mut table = self.table.lock().expect("refcounter mutex poisoned");
        table.entry(key).or_insert(Entry { count: 0, marked_for_delete: false }).count += 1;
    }

    /// Decrements the reference count for `path`. Unlinks the file if the
    /// count reaches zero and it was already marked for delete.
    pub fn release(&self, path: impl AsRef<Path>) -> Result<(), RefCounterError> {
        let path = path.as_ref();
        let key = Self::canonical_key(path);
        let mut table = self.table.lock().expect("refcounter mutex poisoned");
        let should_unlink = match table.get_mut(&key) {
            Some(entry) => {
                entry.count = entry.count.saturating_sub(1);
                entry.count == 0 && entry.marked_for_delete
            }
            None => false,
        };
        if should_unlink {
            table.remove(&key);
            drop(table);
            unlink(path)?;
        }
        Ok(())
    }

    /// Records intent to delete `path` once its reference count reaches
    /// zero. Unlinks immediately if nothing currently holds a reference.
    pub fn mark_for_delete(&self, path: impl AsRef<Path>) -> Result<(), RefCounterError> {
        let path = path.as_ref();
        let key = Self::canonical_key(path);
        let mut table = self.table.lock().expect("refcounter mutex poisoned");
        let should_unlink = match table.get_mut(&key) {
            Some(entry) => {
                entry.marked_for_delete = true;
                entry.count == 0
            }
            None => true,
        };
        if should_unlink {
            table.remove(&key);
            drop(table);
            unlink(path)?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn ref_count(&self, path: impl AsRef<Path>) -> u64 {
        let key = Self::canonical_key(path.as_ref());
        self.table.lock().expect("refcounter mutex poisoned").get(&key).map(|e| e.count).unwrap_or(0)
    }
}

impl Default for RefCounter {
    fn default() -> Self {
        Self::new()
    }
}

fn unlink(path: &Path) -> Result<(), RefCounterError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "shard unlinked");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
