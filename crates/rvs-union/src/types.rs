use std::collections::HashMap;
use std::time::Duration;

use rvs_store::delta::DEFAULT_MAX_DEPTH;
use rvs_store::StoreError;
use rvs_types::ContentKey;
use serde::{Deserialize, Serialize};

/// Where a chain member lives, which decides write-back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreTier {
    /// Private to this checkout. Hits are returned as is.
    Local,
    /// Shared cache. Hits are copied into the write-back target.
    Shared,
}

/// Why a store could not answer a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Corrupt,
    Transport,
    Io,
}

impl FailureKind {
    pub fn of(err: &StoreError) -> Self {
        if err.is_corrupt() {
            Self::Corrupt
        } else if err.is_transport() {
            Self::Transport
        } else {
            Self::Io
        }
    }
}

/// A failure recorded while answering a batch. The keys involved are
/// reported missing unless another store answered them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreFailure {
    pub store: String,
    /// `None` when the whole request failed (e.g. a remote timeout).
    pub key: Option<ContentKey>,
    pub kind: FailureKind,
    pub message: String,
}

impl StoreFailure {
    pub fn new(store: impl Into<String>, key: Option<ContentKey>, err: &StoreError) -> Self {
        Self {
            store: store.into(),
            key,
            kind: FailureKind::of(err),
            message: err.to_string(),
        }
    }

    /// Rebuild a store error carrying this failure's message.
    pub fn to_error(&self) -> StoreError {
        match self.kind {
            FailureKind::Transport => StoreError::Transport(self.message.clone()),
            _ => StoreError::corrupt(self.store.clone(), self.message.clone()),
        }
    }
}

/// Outcome of a batched lookup.
///
/// Partial results are normal: `found` holds every key some store
/// answered, `missing` the rest, and `failures` explains any store that
/// errored instead of answering.
#[derive(Clone, Debug)]
pub struct BatchResult<V> {
    pub found: HashMap<ContentKey, V>,
    pub missing: Vec<ContentKey>,
    pub failures: Vec<StoreFailure>,
}

impl<V> Default for BatchResult<V> {
    fn default() -> Self {
        Self {
            found: HashMap::new(),
            missing: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<V> BatchResult<V> {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// The remote failed or timed out for at least part of the batch.
    pub fn transport_failed(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.kind == FailureKind::Transport)
    }

    pub fn has_corruption(&self) -> bool {
        self.failures.iter().any(|f| f.kind == FailureKind::Corrupt)
    }

    /// Failures recorded against `key` specifically.
    pub fn failures_for<'a>(&'a self, key: &'a ContentKey) -> impl Iterator<Item = &'a StoreFailure> {
        self.failures
            .iter()
            .filter(move |f| f.key.as_ref() == Some(key))
    }
}

/// Tuning for a fallback chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnionOptions {
    /// Longest delta chain followed when materializing full text.
    pub max_delta_depth: usize,
    /// Upper bound on one batched remote request.
    pub remote_timeout: Duration,
}

impl Default for UnionOptions {
    fn default() -> Self {
        Self {
            max_delta_depth: DEFAULT_MAX_DEPTH,
            remote_timeout: Duration::from_secs(30),
        }
    }
}
