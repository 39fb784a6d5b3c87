use std::io;
use std::path::PathBuf;

use rvs_store::StoreError;

/// Errors produced by the indexed log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// I/O error on a segment or lock file.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Record payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record failed its CRC or framing check.
    #[error("corrupt record in segment {segment} at offset {offset}: {reason}")]
    Corrupt {
        segment: u64,
        offset: u64,
        reason: String,
    },

    /// A record at the end of a segment is incomplete: a crash mid-append,
    /// or another process still writing it.
    #[error("incomplete record in segment {segment} at offset {offset}: {reason}")]
    TornTail {
        segment: u64,
        offset: u64,
        reason: String,
    },

    /// Another process holds the writer lock; this handle is read-only.
    #[error("log writer lock held by another process: {}", .0.display())]
    LockContention(PathBuf),

    /// The active segment cannot be removed.
    #[error("segment {0} is the active segment")]
    ActiveSegment(u64),
}

impl From<LogError> for StoreError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::Io(e) => StoreError::Io(e),
            LogError::Serialization(msg) => StoreError::Serialization(msg),
            LogError::LockContention(path) => StoreError::LockContention(path),
            corrupt @ (LogError::Corrupt { .. } | LogError::TornTail { .. }) => StoreError::corrupt("indexedlog", corrupt.to_string()),
            active @ LogError::ActiveSegment(_) => {
                StoreError::Io(io::Error::new(io::ErrorKind::InvalidInput, active.to_string()))
            }
        }
    }
}

/// Convenience alias used throughout the log crate.
pub type LogResult<T> = std::result::Result<T, LogError>;
