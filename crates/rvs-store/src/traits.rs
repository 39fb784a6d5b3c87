use std::path::PathBuf;

use rvs_types::{ContentKey, DataEntry, HistoryEntry};

use crate::error::StoreResult;

/// Lazy sequence of data entries.
pub type DataIter<'a> = Box<dyn Iterator<Item = StoreResult<(ContentKey, DataEntry)>> + 'a>;

/// Lazy sequence of history entries.
pub type HistoryIter<'a> = Box<dyn Iterator<Item = StoreResult<(ContentKey, HistoryEntry)>> + 'a>;

/// Read access to revision content.
///
/// Implementations return entries exactly as stored: a delta entry comes
/// back as a delta. Returns `Ok(None)` when the key is absent and `Err`
/// on I/O failure or corruption.
pub trait DataStore: Send + Sync {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>>;

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.get_entry(key)?.is_some())
    }

    /// Keys from `keys` this store cannot answer, in input order.
    fn get_missing(&self, keys: &[ContentKey]) -> StoreResult<Vec<ContentKey>> {
        let mut missing = Vec::new();
        for key in keys {
            if !self.contains(key)? {
                missing.push(key.clone());
            }
        }
        Ok(missing)
    }

    /// Human-readable name used in logs and failure reports.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Read access to revision ancestry.
pub trait HistoryStore: Send + Sync {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>>;

    fn contains_history(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.get_history(key)?.is_some())
    }

    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// A data store that accepts new entries.
///
/// Writing an entry for a key that is already present replaces it for
/// subsequent reads from this store.
pub trait MutableDataStore: DataStore {
    fn add(&self, key: &ContentKey, entry: &DataEntry) -> StoreResult<()>;

    /// Make previously added entries durable.
    fn flush(&self) -> StoreResult<()>;
}

/// A history store that accepts new entries.
pub trait MutableHistoryStore: HistoryStore {
    fn add_history(&self, key: &ContentKey, entry: &HistoryEntry) -> StoreResult<()>;

    fn flush_history(&self) -> StoreResult<()>;
}

/// A store the repacker can consolidate.
///
/// Iteration restarts from the beginning on every call. `remove` is only
/// called after the consolidated output has been published; it must
/// tolerate backing files that are already gone.
pub trait Repackable: Send + Sync {
    /// Stable identifier for logs and reports.
    fn repack_id(&self) -> String;

    fn iter_data(&self) -> StoreResult<DataIter<'_>> {
        Ok(Box::new(std::iter::empty()))
    }

    fn iter_history(&self) -> StoreResult<HistoryIter<'_>> {
        Ok(Box::new(std::iter::empty()))
    }

    /// Bytes on disk backing this input.
    fn size_bytes(&self) -> u64;

    /// Files `remove` would unlink.
    fn backing_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Unlink the backing files.
    fn remove(&self) -> StoreResult<()>;
}
