use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rvs_store::{
    DataStore, HistoryStore, MutableDataStore, MutableHistoryStore, StoreError, StoreResult,
};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::datapack::encode_data_record;
use crate::error::{PackError, PackResult};
use crate::format::PackKind;
use crate::historypack::encode_history_record;
use crate::index::{IndexEntry, PackIndex};
use crate::pack::PackPaths;

/// Streams records into a temporary body file and publishes the pair.
///
/// Nothing is visible under a pack name until [`PackBuilder::finish`]:
/// the index is renamed into place first, then the body. Directory scans
/// key off the body extension, so a reader never sees a body without its
/// index.
pub struct PackBuilder {
    kind: PackKind,
    dir: PathBuf,
    body: BufWriter<NamedTempFile>,
    hasher: blake3::Hasher,
    offset: u64,
    entries: Vec<IndexEntry>,
}

impl PackBuilder {
    pub fn new(kind: PackKind, dir: &Path) -> PackResult<Self> {
        std::fs::create_dir_all(dir)?;
        let tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(&format!(".{}", kind.body_extension()))
            .tempfile_in(dir)?;
        let mut builder = Self {
            kind,
            dir: dir.to_path_buf(),
            body: BufWriter::new(tmp),
            hasher: blake3::Hasher::new(),
            offset: 0,
            entries: Vec::new(),
        };
        builder.write_raw(&kind.body_header())?;
        Ok(builder)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> PackResult<()> {
        self.body.write_all(bytes)?;
        self.hasher.update(bytes);
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Append one encoded record for `key`.
    pub fn append(&mut self, key: &ContentKey, record: &[u8]) -> PackResult<()> {
        let length = u32::try_from(record.len()).map_err(|_| PackError::CorruptEntry {
            offset: self.offset,
            reason: format!("record of {} bytes is too large", record.len()),
        })?;
        self.entries.push(IndexEntry {
            key: key.clone(),
            offset: self.offset,
            length,
            crc32: crc32fast::hash(record),
        });
        self.write_raw(record)
    }

    /// Records appended so far, duplicates included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes written to the body so far.
    pub fn body_len(&self) -> u64 {
        self.offset
    }

    /// Publish the pack. Returns `None` (and writes nothing) when no
    /// record was appended.
    pub fn finish(self) -> PackResult<Option<PackPaths>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let Self {
            kind,
            dir,
            body,
            hasher,
            offset,
            entries,
        } = self;

        let body = body.into_inner().map_err(|e| e.into_error())?;
        body.as_file().sync_all()?;

        let fingerprint = *hasher.finalize().as_bytes();
        let count = entries.len();
        let index = PackIndex::build(kind, entries, offset, fingerprint);
        let stem = dir.join(hex::encode(&fingerprint[..20]));
        let paths = PackPaths::for_kind(kind, &stem);

        let mut index_tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .suffix(&format!(".{}", kind.index_extension()))
            .tempfile_in(&dir)?;
        index_tmp.write_all(&index.to_bytes()?)?;
        index_tmp.as_file().sync_all()?;
        index_tmp
            .persist(&paths.index)
            .map_err(|e| PackError::Io(e.error))?;
        body.persist(&paths.body)
            .map_err(|e| PackError::Io(e.error))?;
        sync_dir(&dir)?;

        debug!(
            pack = %paths.body.display(),
            records = count,
            unique = index.len(),
            bytes = offset,
            "finalized pack"
        );
        Ok(Some(paths))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// A data pack under construction.
///
/// Readable while being written: lookups are served from an in-memory
/// copy of every entry added, last write winning.
pub struct MutableDataPack {
    inner: Mutex<MutableInner<DataEntry>>,
}

/// A history pack under construction.
pub struct MutableHistoryPack {
    inner: Mutex<MutableInner<HistoryEntry>>,
}

struct MutableInner<V> {
    builder: Option<PackBuilder>,
    entries: HashMap<ContentKey, V>,
}

impl<V: Clone> MutableInner<V> {
    fn new(kind: PackKind, dir: &Path) -> PackResult<Self> {
        Ok(Self {
            builder: Some(PackBuilder::new(kind, dir)?),
            entries: HashMap::new(),
        })
    }

    fn add(&mut self, key: &ContentKey, value: &V, record: &[u8]) -> StoreResult<()> {
        let builder = self.builder.as_mut().ok_or(StoreError::ReadOnly)?;
        builder.append(key, record)?;
        self.entries.insert(key.clone(), value.clone());
        Ok(())
    }

    fn finish(&mut self) -> PackResult<Option<PackPaths>> {
        self.entries.clear();
        match self.builder.take() {
            Some(builder) => builder.finish(),
            None => Ok(None),
        }
    }
}

impl MutableDataPack {
    pub fn new(dir: &Path) -> PackResult<Self> {
        Ok(Self {
            inner: Mutex::new(MutableInner::new(PackKind::Data, dir)?),
        })
    }

    /// Seal and publish the pack. Later `add` calls fail with
    /// [`StoreError::ReadOnly`].
    pub fn finalize(&self) -> PackResult<Option<PackPaths>> {
        self.inner.lock().finish()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStore for MutableDataPack {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    fn describe(&self) -> String {
        "mutable datapack".into()
    }
}

impl MutableDataStore for MutableDataPack {
    fn add(&self, key: &ContentKey, entry: &DataEntry) -> StoreResult<()> {
        let record = encode_data_record(entry)?;
        self.inner.lock().add(key, entry, &record)
    }

    /// Packs become durable only on [`MutableDataPack::finalize`].
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

impl MutableHistoryPack {
    pub fn new(dir: &Path) -> PackResult<Self> {
        Ok(Self {
            inner: Mutex::new(MutableInner::new(PackKind::History, dir)?),
        })
    }

    pub fn finalize(&self) -> PackResult<Option<PackPaths>> {
        self.inner.lock().finish()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MutableHistoryPack {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    fn describe(&self) -> String {
        "mutable histpack".into()
    }
}

impl MutableHistoryStore for MutableHistoryPack {
    fn add_history(&self, key: &ContentKey, entry: &HistoryEntry) -> StoreResult<()> {
        let record = encode_history_record(entry)?;
        self.inner.lock().add(key, entry, &record)
    }

    fn flush_history(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapack::DataPack;
    use crate::historypack::HistoryPack;
    use rvs_types::Node;

    fn key(path: &str, text: &[u8]) -> ContentKey {
        ContentKey::from_str_path(path, Node::hash_revision(&Node::null(), &Node::null(), text))
            .unwrap()
    }

    fn visible_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with(".tmp-"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn hello_scenario_data_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("file.txt", b"hello");

        let data = MutableDataPack::new(dir.path()).unwrap();
        let history = MutableHistoryPack::new(dir.path()).unwrap();
        data.add(&k, &DataEntry::full(b"hello".to_vec())).unwrap();
        history
            .add_history(&k, &HistoryEntry::root(Node::null()))
            .unwrap();
        let data_paths = data.finalize().unwrap().unwrap();
        let hist_paths = history.finalize().unwrap().unwrap();

        let pack = DataPack::open(&data_paths.body).unwrap();
        assert_eq!(pack.get(&k).unwrap().unwrap().payload(), b"hello");
        let hpack = HistoryPack::open(&hist_paths.body).unwrap();
        let h = hpack.get(&k).unwrap().unwrap();
        assert!(h.p1.is_none() && h.p2.is_none());
    }

    #[test]
    fn readable_before_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let pack = MutableDataPack::new(dir.path()).unwrap();
        let k = key("a", b"a");
        pack.add(&k, &DataEntry::full(b"a".to_vec())).unwrap();
        assert!(pack.contains(&k).unwrap());
        assert!(visible_files(dir.path()).is_empty());
    }

    #[test]
    fn last_write_wins_in_pack() {
        let dir = tempfile::tempdir().unwrap();
        let pack = MutableDataPack::new(dir.path()).unwrap();
        let k = key("a", b"a");
        pack.add(&k, &DataEntry::full(b"first".to_vec())).unwrap();
        pack.add(&k, &DataEntry::full(b"second".to_vec())).unwrap();
        assert_eq!(pack.get_entry(&k).unwrap().unwrap().payload(), b"second");

        let paths = pack.finalize().unwrap().unwrap();
        let reopened = DataPack::open(&paths.body).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&k).unwrap().unwrap().payload(), b"second");
    }

    #[test]
    fn empty_pack_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pack = MutableDataPack::new(dir.path()).unwrap();
        assert!(pack.finalize().unwrap().is_none());
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn add_after_finalize_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pack = MutableDataPack::new(dir.path()).unwrap();
        pack.add(&key("a", b"a"), &DataEntry::full(b"a".to_vec())).unwrap();
        pack.finalize().unwrap();
        let err = pack
            .add(&key("b", b"b"), &DataEntry::full(b"b".to_vec()))
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly));
    }

    #[test]
    fn pack_is_named_by_body_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let pack = MutableDataPack::new(dir.path()).unwrap();
        pack.add(&key("a", b"a"), &DataEntry::full(b"a".to_vec())).unwrap();
        let paths = pack.finalize().unwrap().unwrap();

        let body = std::fs::read(&paths.body).unwrap();
        let expected = hex::encode(&blake3::hash(&body).as_bytes()[..20]);
        assert_eq!(
            paths.body.file_stem().unwrap().to_string_lossy(),
            expected.as_str()
        );
        assert_eq!(visible_files(dir.path()).len(), 2);
        DataPack::open(&paths.body).unwrap().verify().unwrap();
    }
}
