use rvs_types::ContentKey;

use crate::error::{PackError, PackResult};
use crate::format::{check_magic, encode_key, PackKind, Reader, PACK_VERSION};

const FAN_OUT: usize = 256;
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + FAN_OUT * 4;
const TRAILER_LEN: usize = 32 + 32;

/// Location of one record inside a pack body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: ContentKey,
    pub offset: u64,
    pub length: u32,
    pub crc32: u32,
}

/// Sorted, checksummed index of a pack body.
///
/// Layout:
/// - `[magic][version][count][body_len]`
/// - fan-out table: 256 entries counting keys whose node's first byte <= i
/// - entries sorted by `(node, path)`: `[key][offset][length][crc32]`
/// - body fingerprint (BLAKE3 of the whole body)
/// - index checksum (BLAKE3 of every preceding index byte)
#[derive(Clone, Debug)]
pub struct PackIndex {
    kind: PackKind,
    fan_out: [u32; FAN_OUT],
    entries: Vec<IndexEntry>,
    body_len: u64,
    fingerprint: [u8; 32],
}

impl PackIndex {
    /// Build an index from record locations. Entries may arrive in any
    /// order; duplicate keys keep the last one given.
    pub fn build(
        kind: PackKind,
        mut entries: Vec<IndexEntry>,
        body_len: u64,
        fingerprint: [u8; 32],
    ) -> Self {
        // Stable sort keeps insertion order among equal keys, so the last
        // write survives the reverse dedup below.
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.reverse();
        entries.dedup_by(|a, b| a.key == b.key);
        entries.reverse();

        let fan_out = build_fan_out(&entries);
        Self {
            kind,
            fan_out,
            entries,
            body_len,
            fingerprint,
        }
    }

    pub fn kind(&self) -> PackKind {
        self.kind
    }

    /// Look up a key: fan-out narrows by first node byte, then binary search.
    pub fn lookup(&self, key: &ContentKey) -> Option<&IndexEntry> {
        let first = key.node.as_bytes()[0] as usize;
        let start = if first == 0 {
            0
        } else {
            self.fan_out[first - 1] as usize
        };
        let end = self.fan_out[first] as usize;
        let range = self.entries.get(start..end)?;
        range
            .binary_search_by(|probe| probe.key.cmp(key))
            .ok()
            .map(|pos| &range[pos])
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.lookup(key).is_some()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn body_len(&self) -> u64 {
        self.body_len
    }

    /// BLAKE3 fingerprint of the body this index describes.
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Fails only for a key whose path does not fit the `u16` length prefix.
    pub fn to_bytes(&self) -> PackResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.entries.len() * 48 + TRAILER_LEN);
        buf.extend_from_slice(self.kind.index_magic());
        buf.extend_from_slice(&PACK_VERSION.to_be_bytes());
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body_len.to_be_bytes());
        for count in &self.fan_out {
            buf.extend_from_slice(&count.to_be_bytes());
        }
        for entry in &self.entries {
            encode_key(&mut buf, &entry.key)?;
            buf.extend_from_slice(&entry.offset.to_be_bytes());
            buf.extend_from_slice(&entry.length.to_be_bytes());
            buf.extend_from_slice(&entry.crc32.to_be_bytes());
        }
        buf.extend_from_slice(&self.fingerprint);
        let checksum = blake3::hash(&buf);
        buf.extend_from_slice(checksum.as_bytes());
        Ok(buf)
    }

    /// Parse and validate an index. Any flipped byte fails the checksum.
    pub fn from_bytes(kind: PackKind, data: &[u8]) -> PackResult<Self> {
        if data.len() < 8 {
            return Err(PackError::IndexCorrupted("too short".into()));
        }
        check_magic(kind.index_magic(), &data[0..4])?;
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        if data.len() < HEADER_LEN + TRAILER_LEN {
            return Err(PackError::IndexCorrupted("header truncated".into()));
        }

        let (content, checksum) = data.split_at(data.len() - 32);
        if blake3::hash(content).as_bytes() != checksum {
            return Err(PackError::ChecksumMismatch("index"));
        }

        let mut r = Reader::new(content, 0);
        r.take(8)?;
        let count = r.u32()? as usize;
        let body_len = r.u64()?;
        let mut fan_out = [0u32; FAN_OUT];
        for slot in fan_out.iter_mut() {
            *slot = r.u32()?;
        }
        if fan_out[FAN_OUT - 1] as usize != count {
            return Err(PackError::IndexCorrupted(format!(
                "fan-out total {} disagrees with count {count}",
                fan_out[FAN_OUT - 1]
            )));
        }

        let mut entries = Vec::with_capacity(count.min(content.len() / 36));
        for _ in 0..count {
            let key = r.key()?;
            let offset = r.u64()?;
            let length = r.u32()?;
            let crc32 = r.u32()?;
            entries.push(IndexEntry {
                key,
                offset,
                length,
                crc32,
            });
        }
        if !entries.windows(2).all(|w| w[0].key < w[1].key) {
            return Err(PackError::IndexCorrupted("entries out of order".into()));
        }

        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(r.take(32)?);
        if r.remaining() != 0 {
            return Err(PackError::IndexCorrupted("trailing bytes".into()));
        }
        if build_fan_out(&entries) != fan_out {
            return Err(PackError::IndexCorrupted("fan-out table mismatch".into()));
        }

        Ok(Self {
            kind,
            fan_out,
            entries,
            body_len,
            fingerprint,
        })
    }
}

fn build_fan_out(entries: &[IndexEntry]) -> [u32; FAN_OUT] {
    let mut counts = [0u32; FAN_OUT];
    for entry in entries {
        counts[entry.key.node.as_bytes()[0] as usize] += 1;
    }
    let mut total = 0u32;
    for slot in counts.iter_mut() {
        total += *slot;
        *slot = total;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rvs_types::Node;

    fn key(path: &str, first: u8, second: u8) -> ContentKey {
        let mut hash = [0u8; 20];
        hash[0] = first;
        hash[1] = second;
        ContentKey::from_str_path(path, Node::from_hash(hash)).unwrap()
    }

    fn entry(key: ContentKey, offset: u64) -> IndexEntry {
        IndexEntry {
            key,
            offset,
            length: 10,
            crc32: offset as u32,
        }
    }

    #[test]
    fn build_empty_index() {
        let idx = PackIndex::build(PackKind::Data, vec![], 8, [0u8; 32]);
        assert!(idx.is_empty());
        assert!(idx.fan_out.iter().all(|&c| c == 0));
        let parsed = PackIndex::from_bytes(PackKind::Data, &idx.to_bytes().unwrap()).unwrap();
        assert!(parsed.is_empty());
        assert_eq!(parsed.body_len(), 8);
    }

    #[test]
    fn lookup_distinguishes_paths_with_same_node() {
        let a = key("a.txt", 5, 5);
        let b = key("b.txt", 5, 5);
        let idx = PackIndex::build(
            PackKind::Data,
            vec![entry(b.clone(), 200), entry(a.clone(), 100)],
            300,
            [0u8; 32],
        );
        assert_eq!(idx.lookup(&a).unwrap().offset, 100);
        assert_eq!(idx.lookup(&b).unwrap().offset, 200);
        assert!(idx.lookup(&key("c.txt", 5, 5)).is_none());
    }

    #[test]
    fn duplicate_keys_keep_last() {
        let a = key("a", 1, 0);
        let idx = PackIndex::build(
            PackKind::Data,
            vec![entry(a.clone(), 8), entry(a.clone(), 40)],
            60,
            [0u8; 32],
        );
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.lookup(&a).unwrap().offset, 40);
    }

    #[test]
    fn serialization_roundtrip() {
        let keys: Vec<_> = (0..40u8).map(|i| key(&format!("f{i}"), i.wrapping_mul(37), i)).collect();
        let entries = keys.iter().enumerate().map(|(i, k)| entry(k.clone(), i as u64 * 10)).collect();
        let idx = PackIndex::build(PackKind::History, entries, 1000, [0xAB; 32]);
        let parsed = PackIndex::from_bytes(PackKind::History, &idx.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.len(), 40);
        assert_eq!(parsed.fingerprint(), &[0xAB; 32]);
        for k in &keys {
            assert_eq!(idx.lookup(k), parsed.lookup(k));
        }
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let idx = PackIndex::build(PackKind::Data, vec![entry(key("a", 1, 2), 8)], 18, [0u8; 32]);
        let mut bytes = idx.to_bytes().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let err = PackIndex::from_bytes(PackKind::Data, &bytes).unwrap_err();
        assert!(matches!(err, PackError::ChecksumMismatch("index")));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let bytes = PackIndex::build(PackKind::Data, vec![], 8, [0u8; 32]).to_bytes().unwrap();
        let err = PackIndex::from_bytes(PackKind::History, &bytes).unwrap_err();
        assert!(matches!(err, PackError::InvalidMagic { .. }));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut data = Vec::new();
        data.extend_from_slice(b"RVDI");
        data.extend_from_slice(&99u32.to_be_bytes());
        let err = PackIndex::from_bytes(PackKind::Data, &data).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedVersion(99)));
    }

    #[test]
    fn truncated_index_is_rejected() {
        let err = PackIndex::from_bytes(PackKind::Data, b"RVDI").unwrap_err();
        assert!(matches!(err, PackError::IndexCorrupted(_)));
    }

    proptest! {
        #[test]
        fn every_built_key_is_found(nodes in proptest::collection::hash_set(any::<[u8; 20]>(), 0..64)) {
            let keys: Vec<_> = nodes
                .into_iter()
                .map(|n| ContentKey::from_str_path("p", Node::from_hash(n)).unwrap())
                .collect();
            let entries = keys.iter().enumerate().map(|(i, k)| entry(k.clone(), i as u64)).collect();
            let idx = PackIndex::build(PackKind::Data, entries, 100, [0u8; 32]);
            for (i, k) in keys.iter().enumerate() {
                prop_assert_eq!(idx.lookup(k).map(|e| e.offset), Some(i as u64));
            }
        }
    }
}
