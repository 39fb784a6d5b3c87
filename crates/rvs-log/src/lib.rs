//! Indexed append-only log for the revision store.
//!
//! Small, incremental writes (remote fetch results, local edits) land here
//! instead of in packs: each write is one CRC-framed record appended to
//! the active segment, indexed in memory by key.
//!
//! - Crash recovery: a torn tail on the active segment is truncated on open.
//! - One writer per directory, enforced by an advisory lock on `lock`;
//!   other handles are read-only and call [`IndexedLog::refresh`].
//! - Segments rotate at a size limit; sealed segments are repack inputs.

pub mod error;
pub mod log;
pub mod segment;
pub mod store;

pub use error::{LogError, LogResult};
pub use log::{IndexedLog, LogConfig, SegmentInfo, SyncMode, LOCK_FILE};
pub use store::{
    IndexedLogDataStore, IndexedLogHistoryStore, SealedSegments, DATA_LOG_DIR, HISTORY_LOG_DIR,
};
