use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::key::{ContentKey, RepoPathBuf};
use crate::node::Node;

/// Byte transform applied to entry payloads at rest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compression {
    /// Stored verbatim.
    #[default]
    None,
    /// zstd frame.
    Zstd,
}

impl Compression {
    /// Tag byte for the on-disk formats.
    pub fn tag(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zstd => 1,
        }
    }

    /// Parse a tag byte. Unknown tags are rejected rather than guessed.
    pub fn from_tag(tag: u8) -> Result<Self, TypeError> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Zstd),
            other => Err(TypeError::UnknownCompression(other)),
        }
    }
}

/// Algorithm used to apply a delta to its base text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaAlgorithm {
    /// Hunk list of `(start, end, replacement)` over the base text.
    #[default]
    Mpatch,
}

impl DeltaAlgorithm {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Mpatch => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, TypeError> {
        match tag {
            1 => Ok(Self::Mpatch),
            other => Err(TypeError::UnknownDeltaAlgorithm(other)),
        }
    }
}

/// The bytes of a revision: either full text or a delta against a base.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataContent {
    Full(Vec<u8>),
    Delta {
        base: ContentKey,
        algorithm: DeltaAlgorithm,
        data: Vec<u8>,
    },
}

/// Content of one revision as held by a store.
///
/// Bytes are always uncompressed in memory; `compression` records how the
/// payload is (or will be) stored at rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEntry {
    pub content: DataContent,
    pub compression: Compression,
}

impl DataEntry {
    /// A full-text entry stored without compression.
    pub fn full(data: impl Into<Vec<u8>>) -> Self {
        Self {
            content: DataContent::Full(data.into()),
            compression: Compression::None,
        }
    }

    /// A delta entry against `base`.
    pub fn delta(base: ContentKey, algorithm: DeltaAlgorithm, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content: DataContent::Delta {
                base,
                algorithm,
                data: data.into(),
            },
            compression: Compression::None,
        }
    }

    /// Same entry, stored with a different codec.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// The delta base, if this entry is a delta.
    pub fn delta_base(&self) -> Option<&ContentKey> {
        match &self.content {
            DataContent::Full(_) => None,
            DataContent::Delta { base, .. } => Some(base),
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self.content, DataContent::Full(_))
    }

    /// The stored payload: full text or delta bytes.
    pub fn payload(&self) -> &[u8] {
        match &self.content {
            DataContent::Full(data) => data,
            DataContent::Delta { data, .. } => data,
        }
    }
}

/// Ancestry record for one revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// First parent. `None` is the null parent.
    pub p1: Option<ContentKey>,
    /// Second parent (merges only).
    pub p2: Option<ContentKey>,
    /// Changeset that introduced this revision.
    pub linknode: Node,
    /// Source path when this revision was created by a copy or rename.
    pub copy_from: Option<RepoPathBuf>,
}

impl HistoryEntry {
    /// A root revision: no parents, no copy source.
    pub fn root(linknode: Node) -> Self {
        Self {
            p1: None,
            p2: None,
            linknode,
            copy_from: None,
        }
    }

    pub fn with_parents(mut self, p1: Option<ContentKey>, p2: Option<ContentKey>) -> Self {
        self.p1 = p1;
        self.p2 = p2;
        self
    }

    pub fn with_copy_from(mut self, path: RepoPathBuf) -> Self {
        self.copy_from = Some(path);
        self
    }

    /// Non-null parents in `p1, p2` order.
    pub fn parents(&self) -> impl Iterator<Item = &ContentKey> {
        self.p1.iter().chain(self.p2.iter())
    }
}
