//! Pack files for the revision store.
//!
//! A pack is an immutable pair of files: a body of length-prefixed records
//! and a sorted, checksummed index over it. Packs are built once by a
//! [`PackBuilder`], published atomically, and only ever unlinked afterwards.
//!
//! # Architecture
//!
//! - **Data pack** (`.datapack` + `.dataidx`): full texts and deltas
//! - **History pack** (`.histpack` + `.histidx`): parents, linknode, copy source
//! - **PackIndex**: fan-out table + binary search, per-record CRC32
//! - **MutableDataPack / MutableHistoryPack**: queryable packs under construction
//! - **PackStore**: every pack of one kind in a directory, newest first

pub mod datapack;
pub mod error;
pub mod format;
pub mod historypack;
pub mod index;
pub mod mutable;
pub mod pack;
pub mod store;

pub use datapack::DataPack;
pub use error::{PackError, PackResult};
pub use format::{PackKind, PACK_VERSION};
pub use historypack::HistoryPack;
pub use index::{IndexEntry, PackIndex};
pub use mutable::{MutableDataPack, MutableHistoryPack, PackBuilder};
pub use pack::{PackOpenOptions, PackPaths};
pub use store::{
    CorruptPack, DataPackStore, HistoryPackStore, PackFormat, PackStore, CORRUPT_DIR,
    STALE_CHECK_INTERVAL,
};

/// Encode a data entry as a pack record, for callers driving a
/// [`PackBuilder`] directly.
pub fn data_record(entry: &rvs_types::DataEntry) -> PackResult<Vec<u8>> {
    datapack::encode_data_record(entry)
}

/// Encode a history entry as a pack record.
pub fn history_record(entry: &rvs_types::HistoryEntry) -> PackResult<Vec<u8>> {
    historypack::encode_history_record(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvs_store::{DataStore, HistoryStore, MutableDataStore, MutableHistoryStore};
    use rvs_types::{Compression, ContentKey, DataEntry, DeltaAlgorithm, HistoryEntry, Node};

    fn key(path: &str, n: u8) -> ContentKey {
        ContentKey::from_str_path(path, Node::from_hash([n; 20])).unwrap()
    }

    #[test]
    fn builder_roundtrip_many_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = PackBuilder::new(PackKind::Data, dir.path()).unwrap();
        let keys: Vec<_> = (0..50u8).map(|i| key(&format!("f{i}"), i)).collect();
        for (i, k) in keys.iter().enumerate() {
            let entry = DataEntry::full(format!("content-{i}").into_bytes())
                .with_compression(if i % 2 == 0 { Compression::Zstd } else { Compression::None });
            builder.append(k, &data_record(&entry).unwrap()).unwrap();
        }
        let paths = builder.finish().unwrap().unwrap();

        let pack = DataPack::open_with(&paths.index, &PackOpenOptions { verify_body: true }).unwrap();
        assert_eq!(pack.len(), 50);
        for (i, k) in keys.iter().enumerate() {
            assert_eq!(
                pack.get(k).unwrap().unwrap().payload(),
                format!("content-{i}").as_bytes()
            );
        }
        assert_eq!(pack.verify().unwrap(), 50);
        assert!(pack.get(&key("absent", 200)).unwrap().is_none());
    }

    #[test]
    fn delta_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base = key("a.txt", 1);
        let child = key("a.txt", 2);
        let pack = MutableDataPack::new(dir.path()).unwrap();
        pack.add(&base, &DataEntry::full(b"hello world".to_vec())).unwrap();
        let delta = rvs_store::delta::diff(b"hello world", b"hello there");
        pack.add(&child, &DataEntry::delta(base.clone(), DeltaAlgorithm::Mpatch, delta))
            .unwrap();
        let paths = pack.finalize().unwrap().unwrap();

        let store = DataPackStore::open(dir.path()).unwrap();
        assert_eq!(store.pack_count(), 1);
        let entry = store.get_entry(&child).unwrap().unwrap();
        assert_eq!(entry.delta_base(), Some(&base));
        let text = rvs_store::delta::resolve(&store, &child, 32).unwrap().unwrap();
        assert_eq!(text, b"hello there");
        assert!(paths.body.exists() && paths.index.exists());
    }

    #[test]
    fn truncated_body_is_rejected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let pack = MutableHistoryPack::new(dir.path()).unwrap();
        pack.add_history(&key("a", 1), &HistoryEntry::root(Node::null()))
            .unwrap();
        let paths = pack.finalize().unwrap().unwrap();

        let body = std::fs::read(&paths.body).unwrap();
        std::fs::write(&paths.body, &body[..body.len() - 3]).unwrap();
        let err = HistoryPack::open(&paths.body).unwrap_err();
        assert!(matches!(err, PackError::SizeMismatch { .. }));

        let store = HistoryPackStore::open(dir.path()).unwrap();
        assert!(store.get_history(&key("a", 1)).unwrap().is_none());
        assert_eq!(store.corrupt_packs().len(), 1);
    }
}
