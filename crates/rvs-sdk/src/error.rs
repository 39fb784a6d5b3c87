use thiserror::Error;

use rvs_types::ContentKey;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("key not found: {0}")]
    NotFound(ContentKey),

    #[error("store error: {0}")]
    Store(#[from] rvs_store::StoreError),

    #[error("pack error: {0}")]
    Pack(#[from] rvs_pack::PackError),

    #[error("log error: {0}")]
    Log(#[from] rvs_log::LogError),

    #[error("repack error: {0}")]
    Repack(#[from] rvs_repack::RepackError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdkError {
    pub fn is_corrupt(&self) -> bool {
        match self {
            Self::Store(e) => e.is_corrupt(),
            Self::Pack(e) => !matches!(e, rvs_pack::PackError::Io(_)),
            Self::Log(e) => matches!(
                e,
                rvs_log::LogError::Corrupt { .. } | rvs_log::LogError::TornTail { .. }
            ),
            _ => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_transport())
    }
}

pub type SdkResult<T> = Result<T, SdkError>;
