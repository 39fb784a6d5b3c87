use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use rvs_log::{IndexedLogDataStore, IndexedLogHistoryStore};
use rvs_pack::{DataPackStore, HistoryPackStore, MutableDataPack, MutableHistoryPack};
use rvs_store::{
    DataStore, HistoryStore, MutableDataStore, MutableHistoryStore, StoreError, StoreResult,
};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{BufferConfig, FinalizeTarget};

/// Stores a [`WriteBuffer`] finalizes into.
#[derive(Clone)]
pub struct BufferTargets {
    pub data_log: Arc<IndexedLogDataStore>,
    pub history_log: Arc<IndexedLogHistoryStore>,
    pub data_packs: Arc<DataPackStore>,
    pub history_packs: Arc<HistoryPackStore>,
}

/// Where the contents of a finalized buffer went.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum Finalized {
    /// Nothing was buffered.
    Empty,
    Log { entries: usize },
    Pack { entries: usize, packs: Vec<PathBuf> },
}

impl Finalized {
    pub fn entries(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Log { entries } | Self::Pack { entries, .. } => *entries,
        }
    }
}

#[derive(Default)]
struct Pending {
    data: HashMap<ContentKey, DataEntry>,
    history: HashMap<ContentKey, HistoryEntry>,
}

impl Pending {
    fn len(&self) -> usize {
        self.data.len() + self.history.len()
    }

    fn sorted_data(&self) -> Vec<(&ContentKey, &DataEntry)> {
        let mut entries: Vec<_> = self.data.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    fn sorted_history(&self) -> Vec<(&ContentKey, &HistoryEntry)> {
        let mut entries: Vec<_> = self.history.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

/// In-memory buffer for new entries, queryable until finalized.
///
/// A later write of a key replaces the earlier one. `finalize` moves the
/// whole buffer into the indexed log or into a new pack; entries stay
/// visible through the buffer until they are readable from the target.
pub struct WriteBuffer {
    targets: BufferTargets,
    pack_threshold: usize,
    pending: RwLock<Pending>,
}

impl WriteBuffer {
    pub fn new(targets: BufferTargets, config: &BufferConfig) -> Self {
        Self {
            targets,
            pack_threshold: config.pack_threshold,
            pending: RwLock::new(Pending::default()),
        }
    }

    /// Buffer content and history for `key`.
    pub fn add_entry(&self, key: &ContentKey, data: DataEntry, history: HistoryEntry) {
        let mut pending = self.pending.write();
        pending.data.insert(key.clone(), data);
        pending.history.insert(key.clone(), history);
    }

    /// Number of buffered data and history entries.
    pub fn len(&self) -> usize {
        self.pending.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every buffered entry to `target` and empty the buffer.
    ///
    /// A log target whose writer lock is held by another process falls
    /// back to a pack. On error the buffer keeps its entries.
    pub fn finalize(&self, target: FinalizeTarget) -> StoreResult<Finalized> {
        let mut pending = self.pending.write();
        let entries = pending.len();
        if entries == 0 {
            return Ok(Finalized::Empty);
        }

        let to_pack = match target {
            FinalizeTarget::Pack => true,
            FinalizeTarget::Log => false,
            FinalizeTarget::Auto => entries >= self.pack_threshold,
        };
        let outcome = if to_pack {
            self.write_pack(&pending)?
        } else if !self.logs_writable() {
            warn!("log writer lock held elsewhere; finalizing buffer to a pack");
            self.write_pack(&pending)?
        } else {
            match self.write_log(&pending) {
                Err(StoreError::LockContention(path)) => {
                    warn!(lock = %path.display(), "log lock lost; finalizing buffer to a pack");
                    self.write_pack(&pending)?
                }
                other => other?,
            }
        };

        *pending = Pending::default();
        debug!(?outcome, "finalized write buffer");
        Ok(outcome)
    }

    fn logs_writable(&self) -> bool {
        self.targets.data_log.log().is_writer() && self.targets.history_log.log().is_writer()
    }

    fn write_log(&self, pending: &Pending) -> StoreResult<Finalized> {
        for (key, entry) in pending.sorted_data() {
            self.targets.data_log.add(key, entry)?;
        }
        for (key, entry) in pending.sorted_history() {
            self.targets.history_log.add_history(key, entry)?;
        }
        self.targets.data_log.flush()?;
        self.targets.history_log.flush_history()?;
        Ok(Finalized::Log {
            entries: pending.len(),
        })
    }

    fn write_pack(&self, pending: &Pending) -> StoreResult<Finalized> {
        let mut packs = Vec::new();
        if !pending.data.is_empty() {
            let pack = MutableDataPack::new(self.targets.data_packs.dir())?;
            for (key, entry) in pending.sorted_data() {
                pack.add(key, entry)?;
            }
            packs.extend(pack.finalize()?.map(|p| p.body));
        }
        if !pending.history.is_empty() {
            let pack = MutableHistoryPack::new(self.targets.history_packs.dir())?;
            for (key, entry) in pending.sorted_history() {
                pack.add_history(key, entry)?;
            }
            packs.extend(pack.finalize()?.map(|p| p.body));
        }
        self.targets.data_packs.rescan()?;
        self.targets.history_packs.rescan()?;
        Ok(Finalized::Pack {
            entries: pending.len(),
            packs,
        })
    }
}

impl DataStore for WriteBuffer {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        Ok(self.pending.read().data.get(key).cloned())
    }

    fn describe(&self) -> String {
        "write buffer".into()
    }
}

impl HistoryStore for WriteBuffer {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        Ok(self.pending.read().history.get(key).cloned())
    }

    fn describe(&self) -> String {
        "write buffer".into()
    }
}

impl MutableDataStore for WriteBuffer {
    fn add(&self, key: &ContentKey, entry: &DataEntry) -> StoreResult<()> {
        self.pending.write().data.insert(key.clone(), entry.clone());
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        self.finalize(FinalizeTarget::Auto).map(|_| ())
    }
}

impl MutableHistoryStore for WriteBuffer {
    fn add_history(&self, key: &ContentKey, entry: &HistoryEntry) -> StoreResult<()> {
        self.pending.write().history.insert(key.clone(), entry.clone());
        Ok(())
    }

    fn flush_history(&self) -> StoreResult<()> {
        self.finalize(FinalizeTarget::Auto).map(|_| ())
    }
}

/// Write-back target for entries copied from the shared cache or the
/// remote.
///
/// Appends to the local logs while this process holds their writer lock.
/// Otherwise the entries go into the write buffer and are finalized into
/// a pack with it.
pub struct WriteBack {
    data_log: Arc<IndexedLogDataStore>,
    history_log: Arc<IndexedLogHistoryStore>,
    buffer: Arc<WriteBuffer>,
}

impl WriteBack {
    pub fn new(buffer: Arc<WriteBuffer>) -> Self {
        Self {
            data_log: buffer.targets.data_log.clone(),
            history_log: buffer.targets.history_log.clone(),
            buffer,
        }
    }
}

impl DataStore for WriteBack {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        match self.buffer.get_entry(key)? {
            Some(entry) => Ok(Some(entry)),
            None => self.data_log.get_entry(key),
        }
    }

    fn describe(&self) -> String {
        "write-back".into()
    }
}

impl HistoryStore for WriteBack {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        match self.buffer.get_history(key)? {
            Some(entry) => Ok(Some(entry)),
            None => self.history_log.get_history(key),
        }
    }

    fn describe(&self) -> String {
        "write-back".into()
    }
}

impl MutableDataStore for WriteBack {
    fn add(&self, key: &ContentKey, entry: &DataEntry) -> StoreResult<()> {
        if self.data_log.log().is_writer() {
            match self.data_log.add(key, entry) {
                Err(StoreError::LockContention(path)) => {
                    debug!(%key, lock = %path.display(), "log locked; buffering write-back");
                }
                other => return other,
            }
        }
        self.buffer.add(key, entry)
    }

    fn flush(&self) -> StoreResult<()> {
        self.data_log.flush()
    }
}

impl MutableHistoryStore for WriteBack {
    fn add_history(&self, key: &ContentKey, entry: &HistoryEntry) -> StoreResult<()> {
        if self.history_log.log().is_writer() {
            match self.history_log.add_history(key, entry) {
                Err(StoreError::LockContention(path)) => {
                    debug!(%key, lock = %path.display(), "log locked; buffering write-back");
                }
                other => return other,
            }
        }
        self.buffer.add_history(key, entry)
    }

    fn flush_history(&self) -> StoreResult<()> {
        self.history_log.flush_history()
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("pending", &self.len())
            .field("pack_threshold", &self.pack_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvs_log::LogConfig;
    use rvs_types::Node;
    use std::path::Path;

    fn key(name: &str) -> ContentKey {
        ContentKey::from_str_path(
            name,
            Node::hash_revision(&Node::null(), &Node::null(), name.as_bytes()),
        )
        .unwrap()
    }

    fn targets(root: &Path) -> BufferTargets {
        BufferTargets {
            data_log: Arc::new(IndexedLogDataStore::open(&root.join("data"), LogConfig::default()).unwrap()),
            history_log: Arc::new(
                IndexedLogHistoryStore::open(&root.join("history"), LogConfig::default()).unwrap(),
            ),
            data_packs: Arc::new(DataPackStore::open(&root.join("packs")).unwrap()),
            history_packs: Arc::new(HistoryPackStore::open(&root.join("packs")).unwrap()),
        }
    }

    fn buffer(root: &Path, pack_threshold: usize) -> (WriteBuffer, BufferTargets) {
        let targets = targets(root);
        let config = BufferConfig {
            pack_threshold,
            finalize: FinalizeTarget::Auto,
        };
        (WriteBuffer::new(targets.clone(), &config), targets)
    }

    #[test]
    fn queryable_before_finalize_and_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, _) = buffer(dir.path(), 10);
        let k = key("a");
        buffer.add(&k, &DataEntry::full(b"one".to_vec())).unwrap();
        buffer.add(&k, &DataEntry::full(b"two".to_vec())).unwrap();
        assert_eq!(buffer.get_entry(&k).unwrap().unwrap().payload(), b"two");
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn small_batches_go_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, targets) = buffer(dir.path(), 10);
        let k = key("a");
        buffer.add_entry(&k, DataEntry::full(b"x".to_vec()), HistoryEntry::root(Node::null()));

        let outcome = buffer.finalize(FinalizeTarget::Auto).unwrap();
        assert_eq!(outcome, Finalized::Log { entries: 2 });
        assert!(buffer.is_empty());
        assert!(buffer.get_entry(&k).unwrap().is_none());
        assert_eq!(targets.data_log.get_entry(&k).unwrap().unwrap().payload(), b"x");
        assert!(targets.history_log.get_history(&k).unwrap().is_some());
        assert_eq!(targets.data_packs.pack_count(), 0);
    }

    #[test]
    fn large_batches_go_to_a_pack() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, targets) = buffer(dir.path(), 4);
        for i in 0..3 {
            let k = key(&format!("f{i}"));
            buffer.add_entry(&k, DataEntry::full(vec![i]), HistoryEntry::root(Node::null()));
        }
        let outcome = buffer.finalize(FinalizeTarget::Auto).unwrap();
        assert!(matches!(outcome, Finalized::Pack { entries: 6, ref packs } if packs.len() == 2));
        assert_eq!(targets.data_packs.pack_count(), 1);
        assert_eq!(targets.history_packs.pack_count(), 1);
        assert_eq!(targets.data_log.log().len(), 0);
        assert_eq!(targets.data_packs.get_entry(&key("f2")).unwrap().unwrap().payload(), &[2]);
    }

    #[test]
    fn empty_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, _) = buffer(dir.path(), 4);
        assert_eq!(buffer.finalize(FinalizeTarget::Pack).unwrap(), Finalized::Empty);
    }

    #[test]
    fn write_back_buffers_when_the_log_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let owner = targets(dir.path());
        let (buffer, targets) = buffer(dir.path(), 100);
        let buffer = Arc::new(buffer);
        let sink = WriteBack::new(buffer.clone());

        let k = key("fetched");
        sink.add(&k, &DataEntry::full(b"remote".to_vec())).unwrap();
        sink.add_history(&k, &HistoryEntry::root(Node::null())).unwrap();
        assert_eq!(buffer.len(), 2);
        assert!(owner.data_log.get_entry(&k).unwrap().is_none());

        let outcome = buffer.finalize(FinalizeTarget::Log).unwrap();
        assert!(matches!(outcome, Finalized::Pack { entries: 2, .. }));
        assert_eq!(targets.data_packs.get_entry(&k).unwrap().unwrap().payload(), b"remote");
        assert!(targets.history_packs.get_history(&k).unwrap().is_some());
    }

    #[test]
    fn write_back_appends_to_the_log_when_writer() {
        let dir = tempfile::tempdir().unwrap();
        let (buffer, targets) = buffer(dir.path(), 100);
        let buffer = Arc::new(buffer);
        let sink = WriteBack::new(buffer.clone());

        let k = key("fetched");
        sink.add(&k, &DataEntry::full(b"remote".to_vec())).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(targets.data_log.get_entry(&k).unwrap().unwrap().payload(), b"remote");
    }

    #[test]
    fn locked_log_falls_back_to_pack() {
        let dir = tempfile::tempdir().unwrap();
        // The first handle holds the writer locks.
        let _owner = targets(dir.path());
        let (buffer, targets) = buffer(dir.path(), 100);
        assert!(!targets.data_log.log().is_writer());

        let k = key("a");
        buffer.add(&k, &DataEntry::full(b"x".to_vec())).unwrap();
        let outcome = buffer.finalize(FinalizeTarget::Log).unwrap();
        assert!(matches!(outcome, Finalized::Pack { entries: 1, .. }));
        assert!(targets.data_packs.get_entry(&k).unwrap().is_some());
    }
}
