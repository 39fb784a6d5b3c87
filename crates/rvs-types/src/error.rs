use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("path too long: {0} bytes")]
    PathTooLong(usize),

    #[error("unknown compression tag: {0}")]
    UnknownCompression(u8),

    #[error("unknown delta algorithm: {0}")]
    UnknownDeltaAlgorithm(u8),
}
