//! Foundation types for the revision store (RVS).
//!
//! Every other RVS crate depends on `rvs-types`. The types here describe
//! *what* is stored; how it is laid out on disk lives in `rvs-pack` and
//! `rvs-log`.
//!
//! # Key Types
//!
//! - [`Node`]: fixed-length revision hash
//! - [`RepoPathBuf`]: repository-relative byte-string path
//! - [`ContentKey`]: `(path, node)`, the lookup unit of every store
//! - [`DataEntry`]: revision content, either full text or a delta
//! - [`HistoryEntry`]: parents, copy source and link node of a revision

pub mod entry;
pub mod error;
pub mod key;
pub mod node;

pub use entry::{Compression, DataContent, DataEntry, DeltaAlgorithm, HistoryEntry};
pub use error::TypeError;
pub use key::{ContentKey, RepoPathBuf, MAX_PATH_LEN};
pub use node::Node;
