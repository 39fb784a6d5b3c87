use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use crate::error::{PackError, PackResult};
use crate::format::{PackKind, BODY_HEADER_LEN};
use crate::index::{IndexEntry, PackIndex};

/// How much validation to do when opening a pack.
#[derive(Clone, Debug, Default)]
pub struct PackOpenOptions {
    /// Hash the whole body and compare it with the index fingerprint.
    /// Index checksum, body size and header are always checked.
    pub verify_body: bool,
}

/// Paths of a finalized pack pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackPaths {
    pub body: PathBuf,
    pub index: PathBuf,
}

impl PackPaths {
    /// Body and index paths for a pack, given either file or the shared stem.
    pub fn for_kind(kind: PackKind, path: &Path) -> Self {
        Self {
            body: path.with_extension(kind.body_extension()),
            index: path.with_extension(kind.index_extension()),
        }
    }
}

/// A memory-mapped pack body plus its parsed index.
///
/// Shared by data and history packs; they differ only in how a record's
/// bytes are decoded.
pub(crate) struct RawPack {
    paths: PackPaths,
    index: PackIndex,
    body: Mmap,
}

impl RawPack {
    pub fn open(kind: PackKind, path: &Path, options: &PackOpenOptions) -> PackResult<Self> {
        let paths = PackPaths::for_kind(kind, path);
        let index_bytes = std::fs::read(&paths.index)?;
        let index = PackIndex::from_bytes(kind, &index_bytes)?;

        let file = File::open(&paths.body)?;
        let actual = file.metadata()?.len();
        if actual != index.body_len() {
            return Err(PackError::SizeMismatch {
                expected: index.body_len(),
                actual,
            });
        }
        if actual < BODY_HEADER_LEN as u64 {
            return Err(PackError::CorruptEntry {
                offset: 0,
                reason: "pack body too short".into(),
            });
        }

        // SAFETY: published pack files are never modified in place; they are
        // only ever unlinked, which leaves an existing mapping valid.
        let body = unsafe { Mmap::map(&file)? };
        kind.check_body_header(&body)?;

        if options.verify_body && blake3::hash(&body).as_bytes() != index.fingerprint() {
            return Err(PackError::ChecksumMismatch("body"));
        }

        debug!(path = %paths.body.display(), entries = index.len(), "opened pack");
        Ok(Self { paths, index, body })
    }

    pub fn paths(&self) -> &PackPaths {
        &self.paths
    }

    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// Raw record bytes for an index entry, CRC-checked.
    pub fn record(&self, entry: &IndexEntry) -> PackResult<&[u8]> {
        let start = entry.offset as usize;
        let end = start
            .checked_add(entry.length as usize)
            .filter(|&end| start >= BODY_HEADER_LEN && end <= self.body.len())
            .ok_or_else(|| PackError::CorruptEntry {
                offset: entry.offset,
                reason: "record extends beyond pack body".into(),
            })?;
        let bytes = &self.body[start..end];
        if crc32fast::hash(bytes) != entry.crc32 {
            return Err(PackError::CrcMismatch {
                key: entry.key.clone(),
            });
        }
        Ok(bytes)
    }

    /// Hash the full body and compare it with the index fingerprint.
    pub fn verify_fingerprint(&self) -> PackResult<()> {
        if blake3::hash(&self.body).as_bytes() != self.index.fingerprint() {
            return Err(PackError::ChecksumMismatch("body"));
        }
        Ok(())
    }

    pub fn size_bytes(&self) -> u64 {
        self.body.len() as u64
            + std::fs::metadata(&self.paths.index)
                .map(|m| m.len())
                .unwrap_or(0)
    }

    /// Unlink both files. Files already gone are not an error.
    pub fn remove_files(&self) -> std::io::Result<()> {
        for path in [&self.paths.body, &self.paths.index] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Short name derived from the file stem.
    pub fn name(&self) -> String {
        self.paths
            .body
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
