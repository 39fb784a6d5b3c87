use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Length in bytes of a [`Node`].
pub const NODE_LEN: usize = 20;

/// Fixed-length revision hash identifying one revision of one file.
///
/// A node is derived from a revision's parents and content, so the same
/// `(path, node)` pair always names the same bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node([u8; NODE_LEN]);

impl Node {
    /// The null node (all zeros). Represents "no revision".
    pub const fn null() -> Self {
        Self([0u8; NODE_LEN])
    }

    /// Returns `true` if this is the null node.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; NODE_LEN]
    }

    /// Create a node from raw bytes.
    pub fn from_hash(hash: [u8; NODE_LEN]) -> Self {
        Self(hash)
    }

    /// Create a node from a byte slice of exactly [`NODE_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; NODE_LEN] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: NODE_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// Hash a revision from its parents and full text.
    ///
    /// Parents are fed in sorted order so `(p1, p2)` and `(p2, p1)` produce
    /// the same node.
    pub fn hash_revision(p1: &Node, p2: &Node, text: &[u8]) -> Self {
        let (a, b) = if p1 <= p2 { (p1, p2) } else { (p2, p1) };
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"rvs-revision-v1:");
        hasher.update(&a.0);
        hasher.update(&b.0);
        hasher.update(text);
        let mut out = [0u8; NODE_LEN];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..NODE_LEN]);
        Self(out)
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_LEN] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 12 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }

    /// Parse from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.short_hex())
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Node {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; NODE_LEN]> for Node {
    fn from(bytes: [u8; NODE_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_all_zeros() {
        let null = Node::null();
        assert!(null.is_null());
        assert_eq!(null.as_bytes(), &[0u8; NODE_LEN]);
    }

    #[test]
    fn hex_roundtrip() {
        let node = Node::hash_revision(&Node::null(), &Node::null(), b"hello");
        let parsed: Node = node.to_hex().parse().unwrap();
        assert_eq!(node, parsed);
        assert_eq!(node.to_hex().len(), 40);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = Node::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: NODE_LEN,
                actual: 2
            }
        );
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(Node::from_hex("zz"), Err(TypeError::InvalidHex(_))));
    }

    #[test]
    fn hash_revision_ignores_parent_order() {
        let p1 = Node::from_hash([1; NODE_LEN]);
        let p2 = Node::from_hash([2; NODE_LEN]);
        assert_eq!(
            Node::hash_revision(&p1, &p2, b"text"),
            Node::hash_revision(&p2, &p1, b"text")
        );
    }

    #[test]
    fn hash_revision_depends_on_content() {
        let a = Node::hash_revision(&Node::null(), &Node::null(), b"a");
        let b = Node::hash_revision(&Node::null(), &Node::null(), b"b");
        assert_ne!(a, b);
        assert!(!a.is_null());
    }

    #[test]
    fn short_hex_is_12_chars() {
        let node = Node::from_hash([0xab; NODE_LEN]);
        assert_eq!(node.short_hex(), "abababababab");
    }
}
