use std::path::{Path, PathBuf};
use std::sync::Arc;

use rvs_store::{
    DataIter, DataStore, HistoryIter, HistoryStore, MutableDataStore, MutableHistoryStore,
    Repackable, StoreError, StoreResult,
};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};

use crate::error::{LogError, LogResult};
use crate::log::{IndexedLog, LogConfig, SegmentInfo};

/// Directory name of the data log under a cache root.
pub const DATA_LOG_DIR: &str = "indexedlogdatastore";

/// Directory name of the history log under a cache root.
pub const HISTORY_LOG_DIR: &str = "indexedloghistorystore";

/// Revision content kept in an [`IndexedLog`].
#[derive(Clone, Debug)]
pub struct IndexedLogDataStore {
    log: Arc<IndexedLog<DataEntry>>,
}

impl IndexedLogDataStore {
    pub fn open(dir: &Path, config: LogConfig) -> LogResult<Self> {
        Ok(Self {
            log: Arc::new(IndexedLog::open(dir, config)?),
        })
    }

    pub fn log(&self) -> &IndexedLog<DataEntry> {
        &self.log
    }

    /// Sealed segments as a single repack input, or `None` when there are
    /// none.
    pub fn repack_input(&self) -> Option<SealedSegments<DataEntry>> {
        SealedSegments::new(Arc::clone(&self.log))
    }
}

impl DataStore for IndexedLogDataStore {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        Ok(self.log.get(key)?)
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.log.contains(key))
    }

    fn describe(&self) -> String {
        format!("indexedlog {}", self.log.dir().display())
    }
}

impl MutableDataStore for IndexedLogDataStore {
    fn add(&self, key: &ContentKey, entry: &DataEntry) -> StoreResult<()> {
        self.log.append(key, entry)?;
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(self.log.flush()?)
    }
}

/// Revision ancestry kept in an [`IndexedLog`].
#[derive(Clone, Debug)]
pub struct IndexedLogHistoryStore {
    log: Arc<IndexedLog<HistoryEntry>>,
}

impl IndexedLogHistoryStore {
    pub fn open(dir: &Path, config: LogConfig) -> LogResult<Self> {
        Ok(Self {
            log: Arc::new(IndexedLog::open(dir, config)?),
        })
    }

    pub fn log(&self) -> &IndexedLog<HistoryEntry> {
        &self.log
    }

    pub fn repack_input(&self) -> Option<SealedSegments<HistoryEntry>> {
        SealedSegments::new(Arc::clone(&self.log))
    }
}

impl HistoryStore for IndexedLogHistoryStore {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        Ok(self.log.get(key)?)
    }

    fn contains_history(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.log.contains(key))
    }

    fn describe(&self) -> String {
        format!("indexedlog {}", self.log.dir().display())
    }
}

impl MutableHistoryStore for IndexedLogHistoryStore {
    fn add_history(&self, key: &ContentKey, entry: &HistoryEntry) -> StoreResult<()> {
        self.log.append(key, entry)?;
        Ok(())
    }

    fn flush_history(&self) -> StoreResult<()> {
        Ok(self.log.flush()?)
    }
}

/// The sealed segments of a log, fixed at construction.
///
/// Segments sealed later are not part of this input, and the active
/// segment never is.
pub struct SealedSegments<V> {
    log: Arc<IndexedLog<V>>,
    segments: Vec<SegmentInfo>,
}

impl<V> SealedSegments<V>
where
    V: serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    fn new(log: Arc<IndexedLog<V>>) -> Option<Self> {
        let segments = log.sealed_segments();
        if segments.is_empty() {
            return None;
        }
        Some(Self { log, segments })
    }

    pub fn segments(&self) -> &[SegmentInfo] {
        &self.segments
    }

    fn iter_all(&self) -> impl Iterator<Item = StoreResult<(ContentKey, V)>> + '_ {
        self.segments.iter().flat_map(move |segment| {
            let records: Box<dyn Iterator<Item = StoreResult<(ContentKey, V)>>> =
                match self.log.iter_segment(segment.id) {
                    Ok(iter) => Box::new(iter.map(|r| r.map_err(StoreError::from))),
                    // Removed by a concurrent repack: nothing left to carry over.
                    Err(LogError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        Box::new(std::iter::empty())
                    }
                    Err(e) => Box::new(std::iter::once(Err(e.into()))),
                };
            records
        })
    }

    fn id(&self) -> String {
        let first = self.segments.first().map(|s| s.id).unwrap_or_default();
        let last = self.segments.last().map(|s| s.id).unwrap_or_default();
        format!("{} segments {first}..={last}", self.log.dir().display())
    }

    fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    fn remove_all(&self) -> StoreResult<()> {
        let ids: Vec<u64> = self.segments.iter().map(|s| s.id).collect();
        Ok(self.log.remove_segments(&ids)?)
    }
}

impl Repackable for SealedSegments<DataEntry> {
    fn repack_id(&self) -> String {
        self.id()
    }

    fn iter_data(&self) -> StoreResult<DataIter<'_>> {
        Ok(Box::new(self.iter_all()))
    }

    fn size_bytes(&self) -> u64 {
        self.total_len()
    }

    fn backing_files(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path.clone()).collect()
    }

    fn remove(&self) -> StoreResult<()> {
        self.remove_all()
    }
}

impl Repackable for SealedSegments<HistoryEntry> {
    fn repack_id(&self) -> String {
        self.id()
    }

    fn iter_history(&self) -> StoreResult<HistoryIter<'_>> {
        Ok(Box::new(self.iter_all()))
    }

    fn size_bytes(&self) -> u64 {
        self.total_len()
    }

    fn backing_files(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path.clone()).collect()
    }

    fn remove(&self) -> StoreResult<()> {
        self.remove_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvs_types::Node;

    fn key(name: &str) -> ContentKey {
        ContentKey::from_str_path(
            name,
            Node::hash_revision(&Node::null(), &Node::null(), name.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn data_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexedLogDataStore::open(dir.path(), LogConfig::default()).unwrap();
        let k = key("file.txt");
        store.add(&k, &DataEntry::full(b"hello".to_vec())).unwrap();
        store.flush().unwrap();
        assert_eq!(store.get_entry(&k).unwrap().unwrap().payload(), b"hello");
        assert!(store.contains(&k).unwrap());
    }

    #[test]
    fn history_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexedLogHistoryStore::open(dir.path(), LogConfig::default()).unwrap();
        let (parent, child) = (key("a"), key("b"));
        let entry = HistoryEntry::root(Node::null()).with_parents(Some(parent.clone()), None);
        store.add_history(&child, &entry).unwrap();
        assert_eq!(store.get_history(&child).unwrap(), Some(entry));
        assert!(!store.contains_history(&parent).unwrap());
    }

    #[test]
    fn read_only_store_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let _writer = IndexedLogDataStore::open(dir.path(), LogConfig::default()).unwrap();
        let reader = IndexedLogDataStore::open(dir.path(), LogConfig::default()).unwrap();
        let err = reader
            .add(&key("a"), &DataEntry::full(b"x".to_vec()))
            .unwrap_err();
        assert!(matches!(err, StoreError::LockContention(_)));
    }

    #[test]
    fn sealed_segments_as_repack_input() {
        let dir = tempfile::tempdir().unwrap();
        let store = IndexedLogDataStore::open(dir.path(), LogConfig::default()).unwrap();
        assert!(store.repack_input().is_none());

        store.add(&key("a"), &DataEntry::full(b"1".to_vec())).unwrap();
        store.add(&key("a"), &DataEntry::full(b"2".to_vec())).unwrap();
        store.log().seal().unwrap();
        store.add(&key("b"), &DataEntry::full(b"3".to_vec())).unwrap();

        let input = store.repack_input().unwrap();
        assert_eq!(input.segments().len(), 1);
        let records: Vec<_> = input.iter_data().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].1.payload(), b"2");
        // Restartable.
        assert_eq!(input.iter_data().unwrap().count(), 2);
        assert_eq!(input.iter_history().unwrap().count(), 0);

        input.remove().unwrap();
        assert!(store.get_entry(&key("a")).unwrap().is_none());
        assert!(store.get_entry(&key("b")).unwrap().is_some());
        // Removing again is harmless.
        input.remove().unwrap();
    }
}
