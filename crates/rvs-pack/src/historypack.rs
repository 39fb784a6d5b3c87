use std::path::{Path, PathBuf};

use rvs_store::{HistoryIter, HistoryStore, Repackable, StoreResult};
use rvs_types::{ContentKey, HistoryEntry};

use crate::error::{PackError, PackResult};
use crate::format::{encode_opt_key, encode_path, PackKind, Reader};
use crate::index::{IndexEntry, PackIndex};
use crate::pack::{PackOpenOptions, PackPaths, RawPack};

/// `[len u32][p1 opt key][p2 opt key][linknode 20][copy_from opt path]`
pub(crate) fn encode_history_record(entry: &HistoryEntry) -> PackResult<Vec<u8>> {
    let mut body = Vec::with_capacity(96);
    encode_opt_key(&mut body, entry.p1.as_ref())?;
    encode_opt_key(&mut body, entry.p2.as_ref())?;
    body.extend_from_slice(entry.linknode.as_bytes());
    match &entry.copy_from {
        Some(path) => {
            body.push(1);
            encode_path(&mut body, path)?;
        }
        None => body.push(0),
    }

    let mut record = Vec::with_capacity(body.len() + 4);
    record.extend_from_slice(&(body.len() as u32).to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

pub(crate) fn decode_history_record(bytes: &[u8], offset: u64) -> PackResult<HistoryEntry> {
    let mut r = Reader::new(bytes, offset);
    let len = r.u32()? as usize;
    if len != r.remaining() {
        return Err(PackError::CorruptEntry {
            offset,
            reason: format!("record length {len} disagrees with index ({})", r.remaining()),
        });
    }
    let p1 = r.opt_key()?;
    let p2 = r.opt_key()?;
    let linknode = r.node()?;
    let copy_from = r.opt_path()?;
    if r.remaining() != 0 {
        return Err(PackError::CorruptEntry {
            offset: offset + r.position() as u64,
            reason: "trailing bytes in history record".into(),
        });
    }
    Ok(HistoryEntry {
        p1,
        p2,
        linknode,
        copy_from,
    })
}

/// Immutable, memory-mapped history pack.
pub struct HistoryPack {
    raw: RawPack,
}

impl HistoryPack {
    pub fn open(path: &Path) -> PackResult<Self> {
        Self::open_with(path, &PackOpenOptions::default())
    }

    pub fn open_with(path: &Path, options: &PackOpenOptions) -> PackResult<Self> {
        Ok(Self {
            raw: RawPack::open(PackKind::History, path, options)?,
        })
    }

    pub fn get(&self, key: &ContentKey) -> PackResult<Option<HistoryEntry>> {
        match self.raw.index().lookup(key) {
            Some(entry) => self.read(entry).map(Some),
            None => Ok(None),
        }
    }

    fn read(&self, entry: &IndexEntry) -> PackResult<HistoryEntry> {
        decode_history_record(self.raw.record(entry)?, entry.offset)
    }

    pub fn iter(&self) -> impl Iterator<Item = PackResult<(ContentKey, HistoryEntry)>> + '_ {
        self.raw
            .index()
            .entries()
            .iter()
            .map(move |entry| Ok((entry.key.clone(), self.read(entry)?)))
    }

    pub fn verify(&self) -> PackResult<usize> {
        self.raw.verify_fingerprint()?;
        let mut count = 0;
        for item in self.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn index(&self) -> &PackIndex {
        self.raw.index()
    }

    pub fn paths(&self) -> &PackPaths {
        self.raw.paths()
    }

    pub fn len(&self) -> usize {
        self.raw.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.index().is_empty()
    }

    pub fn name(&self) -> String {
        self.raw.name()
    }
}

impl std::fmt::Debug for HistoryPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryPack")
            .field("path", &self.raw.paths().body)
            .field("entries", &self.len())
            .finish()
    }
}

impl HistoryStore for HistoryPack {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        self.get(key)
            .map_err(|e| e.into_store_error(&self.raw.paths().body))
    }

    fn contains_history(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.raw.index().contains(key))
    }

    fn describe(&self) -> String {
        format!("histpack {}", self.name())
    }
}

impl Repackable for HistoryPack {
    fn repack_id(&self) -> String {
        self.name()
    }

    fn iter_history(&self) -> StoreResult<HistoryIter<'_>> {
        let body = self.raw.paths().body.clone();
        Ok(Box::new(
            self.iter()
                .map(move |item| item.map_err(|e| e.into_store_error(&body))),
        ))
    }

    fn size_bytes(&self) -> u64 {
        self.raw.size_bytes()
    }

    fn backing_files(&self) -> Vec<PathBuf> {
        let paths = self.raw.paths();
        vec![paths.body.clone(), paths.index.clone()]
    }

    fn remove(&self) -> StoreResult<()> {
        Ok(self.raw.remove_files()?)
    }
}
