use std::collections::HashMap;

use parking_lot::RwLock;
use rvs_types::{ContentKey, DataEntry, HistoryEntry};

use crate::error::StoreResult;
use crate::traits::{
    DataIter, DataStore, HistoryIter, HistoryStore, MutableDataStore, MutableHistoryStore,
    Repackable,
};

/// In-memory, HashMap-based store for data and history.
///
/// Intended for tests and for embedding a fake remote. Entries are cloned
/// on read and write.
pub struct InMemoryStore {
    name: String,
    data: RwLock<HashMap<ContentKey, DataEntry>>,
    history: RwLock<HashMap<ContentKey, HistoryEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// A store that reports itself under `name` in logs and failures.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Number of data entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty() && self.history.read().is_empty()
    }

    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    /// Sorted list of every data key.
    pub fn data_keys(&self) -> Vec<ContentKey> {
        let mut keys: Vec<_> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.data.write().clear();
        self.history.write().clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for InMemoryStore {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.data.read().contains_key(key))
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

impl HistoryStore for InMemoryStore {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        Ok(self.history.read().get(key).cloned())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

impl MutableDataStore for InMemoryStore {
    fn add(&self, key: &ContentKey, entry: &DataEntry) -> StoreResult<()> {
        self.data.write().insert(key.clone(), entry.clone());
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl MutableHistoryStore for InMemoryStore {
    fn add_history(&self, key: &ContentKey, entry: &HistoryEntry) -> StoreResult<()> {
        self.history.write().insert(key.clone(), entry.clone());
        Ok(())
    }

    fn flush_history(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl Repackable for InMemoryStore {
    fn repack_id(&self) -> String {
        self.name.clone()
    }

    fn iter_data(&self) -> StoreResult<DataIter<'_>> {
        let mut entries: Vec<_> = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn iter_history(&self) -> StoreResult<HistoryIter<'_>> {
        let mut entries: Vec<_> = self
            .history
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn size_bytes(&self) -> u64 {
        self.data
            .read()
            .values()
            .map(|e| e.payload().len() as u64)
            .sum()
    }

    fn remove(&self) -> StoreResult<()> {
        self.clear();
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("name", &self.name)
            .field("data", &self.len())
            .field("history", &self.history_len())
            .finish()
    }
}
