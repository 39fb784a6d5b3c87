//! High-level API for the revision store.
//!
//! [`RevisionStore`] is the entry point: it opens a local store root and
//! an optional shared cache root, puts a [`WriteBuffer`] in front of them
//! and an optional remote behind them, and answers lookups through one
//! fallback chain.
//!
//! ```no_run
//! use rvs_sdk::{RevisionStore, StoreConfig};
//! use rvs_types::{ContentKey, DataEntry, HistoryEntry, Node};
//!
//! let store = RevisionStore::open(StoreConfig::at("/tmp/rvs"), None)?;
//! let key = ContentKey::from_str_path("file.txt", Node::hash_revision(&Node::null(), &Node::null(), b"hello"))?;
//! store.add(&key, DataEntry::full(b"hello".to_vec()), HistoryEntry::root(Node::null()))?;
//! store.flush()?;
//! assert_eq!(store.get(&key)?.as_deref(), Some(&b"hello"[..]));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod repository;

pub use buffer::{BufferTargets, Finalized, WriteBack, WriteBuffer};
pub use config::{
    BufferConfig, FinalizeTarget, PackConfig, RemoteConfig, RepackConfig, StoreConfig,
};
pub use error::{SdkError, SdkResult};
pub use repository::{
    RepackSummary, RevisionStore, RootStats, StoreStats, VerifyProblem, VerifyReport, PACK_DIR,
};

// Re-export key types
pub use rvs_log::{LogConfig, SyncMode};
pub use rvs_repack::RepackReport;
pub use rvs_types::{ContentKey, DataEntry, HistoryEntry, Node, RepoPathBuf};
pub use rvs_union::{BatchResult, FailureKind, RemoteStore, StoreFailure, StoreRemote, StoreTier};
