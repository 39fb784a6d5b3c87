use std::path::PathBuf;

use rvs_pack::PackError;
use rvs_store::StoreError;

/// Errors from a repack pass.
///
/// Any error leaves the inputs authoritative: outputs of the failed pass
/// have been removed and no input was unlinked.
#[derive(Debug, thiserror::Error)]
pub enum RepackError {
    /// Another process is publishing a repack of the same cache.
    #[error("repack lock held by another process: {}", .0.display())]
    LockContention(PathBuf),

    /// An input no longer yields the entries selected from it, so the
    /// pass cannot write them and must not unlink the input.
    #[error("repack input {input} changed during the pass: {reason}")]
    InputChanged { input: String, reason: String },

    #[error("pack error: {0}")]
    Pack(#[from] PackError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RepackError> for StoreError {
    fn from(err: RepackError) -> Self {
        match err {
            RepackError::LockContention(path) => StoreError::LockContention(path),
            RepackError::InputChanged { input, reason } => StoreError::corrupt(input, reason),
            RepackError::Pack(e) => e.into(),
            RepackError::Store(e) => e,
            RepackError::Io(e) => StoreError::Io(e),
        }
    }
}

pub type RepackResult<T> = Result<T, RepackError>;
