use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::node::Node;

/// Longest path a key may carry; paths are length-prefixed with a `u16`
/// in every on-disk format.
pub const MAX_PATH_LEN: usize = u16::MAX as usize;

/// Repository-relative path stored as raw bytes.
///
/// Paths are not required to be UTF-8. Display uses a lossy conversion.
/// Deserialization applies the same length limit as [`RepoPathBuf::new`].
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>")]
pub struct RepoPathBuf(Vec<u8>);

impl RepoPathBuf {
    /// Create a path, rejecting paths longer than [`MAX_PATH_LEN`].
    pub fn new(path: impl Into<Vec<u8>>) -> Result<Self, TypeError> {
        let bytes = path.into();
        if bytes.len() > MAX_PATH_LEN {
            return Err(TypeError::PathTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    /// The empty path.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for RepoPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl TryFrom<Vec<u8>> for RepoPathBuf {
    type Error = TypeError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for RepoPathBuf {
    type Error = TypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value.as_bytes())
    }
}

/// Identity of one revision of one file: `(path, node)`.
///
/// Keys order by node first and path second. Pack indexes are sorted in
/// this order, so lookups can binary search on the node alone before
/// disambiguating by path.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    pub path: RepoPathBuf,
    pub node: Node,
}

impl ContentKey {
    pub fn new(path: RepoPathBuf, node: Node) -> Self {
        Self { path, node }
    }

    /// Convenience constructor from a string path.
    pub fn from_str_path(path: &str, node: Node) -> Result<Self, TypeError> {
        Ok(Self::new(RepoPathBuf::try_from(path)?, node))
    }
}

impl PartialOrd for ContentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node
            .cmp(&other.node)
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({}@{})", self.path, self.node.short_hex())
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.node.short_hex())
    }
}
