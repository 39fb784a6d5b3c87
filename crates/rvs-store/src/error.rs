use std::path::PathBuf;
use std::time::Duration;

use rvs_types::{ContentKey, TypeError};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key is absent from every store the caller required.
    #[error("key not found: {0}")]
    NotFound(ContentKey),

    /// A store or entry failed validation (checksum, size, format).
    #[error("corrupt store {store}: {reason}")]
    Corrupt { store: String, reason: String },

    /// A delta entry references a base no store in the chain can produce.
    #[error("delta base {base} of {key} not found")]
    MissingDeltaBase { key: ContentKey, base: ContentKey },

    /// A delta chain is longer than the configured limit (or loops).
    #[error("delta chain of {key} exceeds {limit} links")]
    DeltaChainTooDeep { key: ContentKey, limit: usize },

    /// Delta bytes do not apply to their base.
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    /// The remote collaborator failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote collaborator did not answer in time.
    #[error("remote fetch timed out after {0:?}")]
    Timeout(Duration),

    /// Another process holds the writer lock.
    #[error("write lock held by another process: {}", .0.display())]
    LockContention(PathBuf),

    /// The store was opened without write access.
    #[error("store is read-only")]
    ReadOnly,

    #[error("compression error: {0}")]
    Compression(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid value: {0}")]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Shorthand for [`StoreError::Corrupt`].
    pub fn corrupt(store: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            store: store.into(),
            reason: reason.into(),
        }
    }

    /// Data-integrity failures: the affected store or entry must be skipped.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::Corrupt { .. }
                | Self::MissingDeltaBase { .. }
                | Self::DeltaChainTooDeep { .. }
                | Self::InvalidDelta(_)
                | Self::Compression(_)
                | Self::Type(_)
        )
    }

    /// Remote failures: the keys involved are reported missing.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }

    /// The underlying file disappeared (e.g. unlinked by a repack).
    pub fn is_vanished(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
