//! Shared byte-level pieces of the pack formats.
//!
//! All integers are big-endian. Keys are encoded as
//! `[node: 20][path_len: u16][path bytes]`.

use rvs_types::{ContentKey, Node, RepoPathBuf, TypeError};

use crate::error::{PackError, PackResult};

/// Current version of both pack bodies and pack indexes.
pub const PACK_VERSION: u32 = 1;

/// Bytes of `[magic][version]` at the start of every body.
pub const BODY_HEADER_LEN: usize = 8;

/// Which half of a pack pair a file belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PackKind {
    Data,
    History,
}

impl PackKind {
    pub fn body_extension(&self) -> &'static str {
        match self {
            Self::Data => "datapack",
            Self::History => "histpack",
        }
    }

    pub fn index_extension(&self) -> &'static str {
        match self {
            Self::Data => "dataidx",
            Self::History => "histidx",
        }
    }

    pub fn body_magic(&self) -> &'static [u8; 4] {
        match self {
            Self::Data => b"RVDP",
            Self::History => b"RVHP",
        }
    }

    pub fn index_magic(&self) -> &'static [u8; 4] {
        match self {
            Self::Data => b"RVDI",
            Self::History => b"RVHI",
        }
    }

    /// Body header bytes for a freshly created pack.
    pub fn body_header(&self) -> [u8; BODY_HEADER_LEN] {
        let mut header = [0u8; BODY_HEADER_LEN];
        header[..4].copy_from_slice(self.body_magic());
        header[4..].copy_from_slice(&PACK_VERSION.to_be_bytes());
        header
    }

    /// Validate the `[magic][version]` prefix of a body.
    pub fn check_body_header(&self, data: &[u8]) -> PackResult<()> {
        if data.len() < BODY_HEADER_LEN {
            return Err(PackError::CorruptEntry {
                offset: 0,
                reason: "pack body too short".into(),
            });
        }
        check_magic(self.body_magic(), &data[..4])?;
        let version = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        if version != PACK_VERSION {
            return Err(PackError::UnsupportedVersion(version));
        }
        Ok(())
    }
}

pub(crate) fn check_magic(expected: &[u8; 4], actual: &[u8]) -> PackResult<()> {
    if actual != expected {
        return Err(PackError::InvalidMagic {
            expected: String::from_utf8_lossy(expected).into(),
            actual: String::from_utf8_lossy(actual).into(),
        });
    }
    Ok(())
}

/// Append `[path_len: u16][path bytes]`.
pub(crate) fn encode_path(buf: &mut Vec<u8>, path: &RepoPathBuf) -> PackResult<()> {
    let len = u16::try_from(path.len()).map_err(|_| TypeError::PathTooLong(path.len()))?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    Ok(())
}

pub(crate) fn encode_key(buf: &mut Vec<u8>, key: &ContentKey) -> PackResult<()> {
    buf.extend_from_slice(key.node.as_bytes());
    encode_path(buf, &key.path)
}

pub(crate) fn encode_opt_key(buf: &mut Vec<u8>, key: Option<&ContentKey>) -> PackResult<()> {
    match key {
        Some(key) => {
            buf.push(1);
            encode_key(buf, key)
        }
        None => {
            buf.push(0);
            Ok(())
        }
    }
}

/// Bounds-checked reader over a byte slice. `base` is the absolute
/// offset of `data[0]`, used in error messages.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8], base: u64) -> Self {
        Self { data, pos: 0, base }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn take(&mut self, len: usize) -> PackResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(PackError::CorruptEntry {
                offset: self.base + self.pos as u64,
                reason: format!("need {len} bytes, {} left", self.remaining()),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn u8(&mut self) -> PackResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> PackResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> PackResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> PackResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn node(&mut self) -> PackResult<Node> {
        Ok(Node::from_slice(self.take(20)?)?)
    }

    pub fn path(&mut self) -> PackResult<RepoPathBuf> {
        let len = self.u16()? as usize;
        Ok(RepoPathBuf::new(self.take(len)?)?)
    }

    pub fn key(&mut self) -> PackResult<ContentKey> {
        let node = self.node()?;
        let path = self.path()?;
        Ok(ContentKey::new(path, node))
    }

    pub fn opt_key(&mut self) -> PackResult<Option<ContentKey>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.key()?)),
            other => Err(PackError::CorruptEntry {
                offset: self.base + self.pos as u64 - 1,
                reason: format!("invalid presence byte {other}"),
            }),
        }
    }

    pub fn opt_path(&mut self) -> PackResult<Option<RepoPathBuf>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.path()?)),
            other => Err(PackError::CorruptEntry {
                offset: self.base + self.pos as u64 - 1,
                reason: format!("invalid presence byte {other}"),
            }),
        }
    }
}
