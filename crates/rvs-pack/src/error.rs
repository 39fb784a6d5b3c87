use std::path::Path;

use rvs_store::StoreError;
use rvs_types::{ContentKey, TypeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid pack magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    #[error("unsupported pack version: {0}")]
    UnsupportedVersion(u32),

    #[error("{0} checksum mismatch")]
    ChecksumMismatch(&'static str),

    #[error("pack body is {actual} bytes, index expects {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("corrupt pack entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("CRC32 mismatch for {key}")]
    CrcMismatch { key: ContentKey },

    #[error("index corrupted: {0}")]
    IndexCorrupted(String),

    #[error("invalid field: {0}")]
    Type(#[from] TypeError),

    #[error("payload codec failed: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackError {
    /// Convert into the store taxonomy, naming the pack that failed.
    pub fn into_store_error(self, pack: &Path) -> StoreError {
        match self {
            Self::Io(e) => StoreError::Io(e),
            other => StoreError::corrupt(pack.display().to_string(), other.to_string()),
        }
    }
}

impl From<PackError> for StoreError {
    fn from(err: PackError) -> Self {
        match err {
            PackError::Io(e) => StoreError::Io(e),
            other => StoreError::corrupt("pack", other.to_string()),
        }
    }
}

pub type PackResult<T> = Result<T, PackError>;
