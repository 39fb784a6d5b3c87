use std::path::{Path, PathBuf};

use rvs_store::{codec_for, DataIter, DataStore, Repackable, StoreResult};
use rvs_types::{Compression, ContentKey, DataContent, DataEntry, DeltaAlgorithm};

use crate::error::{PackError, PackResult};
use crate::format::{encode_key, PackKind, Reader};
use crate::index::{IndexEntry, PackIndex};
use crate::pack::{PackOpenOptions, PackPaths, RawPack};

const KIND_FULL: u8 = 0;
const KIND_DELTA: u8 = 1;

/// Serialize one data record.
///
/// ```text
/// [len: u32][compression: u8][kind: u8][delta: algorithm u8 + base key]
/// [raw_len: u32][payload, compressed]
/// ```
///
/// `len` counts the bytes after itself.
pub(crate) fn encode_data_record(entry: &DataEntry) -> PackResult<Vec<u8>> {
    let payload = entry.payload();
    let stored = codec_for(entry.compression)
        .compress(payload)
        .map_err(|e| PackError::Codec(e.to_string()))?;

    let mut body = Vec::with_capacity(stored.len() + 64);
    body.push(entry.compression.tag());
    match &entry.content {
        DataContent::Full(_) => body.push(KIND_FULL),
        DataContent::Delta {
            base, algorithm, ..
        } => {
            body.push(KIND_DELTA);
            body.push(algorithm.tag());
            encode_key(&mut body, base)?;
        }
    }
    body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    body.extend_from_slice(&stored);

    let mut record = Vec::with_capacity(body.len() + 4);
    record.extend_from_slice(&(body.len() as u32).to_be_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

pub(crate) fn decode_data_record(bytes: &[u8], offset: u64) -> PackResult<DataEntry> {
    let mut r = Reader::new(bytes, offset);
    let len = r.u32()? as usize;
    if len != r.remaining() {
        return Err(PackError::CorruptEntry {
            offset,
            reason: format!("record length {len} disagrees with index ({})", r.remaining()),
        });
    }
    let compression = Compression::from_tag(r.u8()?)?;
    let kind = r.u8()?;
    let delta = match kind {
        KIND_FULL => None,
        KIND_DELTA => {
            let algorithm = DeltaAlgorithm::from_tag(r.u8()?)?;
            Some((r.key()?, algorithm))
        }
        other => {
            return Err(PackError::CorruptEntry {
                offset,
                reason: format!("unknown record kind {other}"),
            })
        }
    };
    let raw_len = r.u32()? as usize;
    let stored = r.take(r.remaining())?;
    let data = codec_for(compression)
        .decompress(stored, Some(raw_len))
        .map_err(|e| PackError::CorruptEntry {
            offset,
            reason: e.to_string(),
        })?;

    let content = match delta {
        None => DataContent::Full(data),
        Some((base, algorithm)) => DataContent::Delta {
            base,
            algorithm,
            data,
        },
    };
    Ok(DataEntry {
        content,
        compression,
    })
}

/// Immutable, memory-mapped data pack.
pub struct DataPack {
    raw: RawPack,
}

impl DataPack {
    pub fn open(path: &Path) -> PackResult<Self> {
        Self::open_with(path, &PackOpenOptions::default())
    }

    pub fn open_with(path: &Path, options: &PackOpenOptions) -> PackResult<Self> {
        Ok(Self {
            raw: RawPack::open(PackKind::Data, path, options)?,
        })
    }

    pub fn get(&self, key: &ContentKey) -> PackResult<Option<DataEntry>> {
        match self.raw.index().lookup(key) {
            Some(entry) => self.read(entry).map(Some),
            None => Ok(None),
        }
    }

    fn read(&self, entry: &IndexEntry) -> PackResult<DataEntry> {
        decode_data_record(self.raw.record(entry)?, entry.offset)
    }

    /// Entries in index order. Restarts from the first key on every call.
    pub fn iter(&self) -> impl Iterator<Item = PackResult<(ContentKey, DataEntry)>> + '_ {
        self.raw
            .index()
            .entries()
            .iter()
            .map(move |entry| Ok((entry.key.clone(), self.read(entry)?)))
    }

    /// Check the body fingerprint and decode every record.
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

impl std::fmt::Debug for DataPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPack")
            .field("path", &self.raw.paths().body)
            .field("entries", &self.len())
            .finish()
    }
}

impl DataStore for DataPack {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        self.get(key)
            .map_err(|e| e.into_store_error(&self.raw.paths().body))
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        Ok(self.raw.index().contains(key))
    }

    fn describe(&self) -> String {
        format!("datapack {}", self.name())
    }
}

impl Repackable for DataPack {
    fn repack_id(&self) -> String {
        self.name()
    }

    fn iter_data(&self) -> StoreResult<DataIter<'_>> {
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
