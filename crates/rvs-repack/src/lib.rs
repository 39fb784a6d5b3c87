//! Repacking for the revision store.
//!
//! A repack pass reads every entry of its inputs (pack files, sealed log
//! segments), keeps one entry per key, and writes the survivors into new
//! packs no larger than [`RepackOptions::max_pack_size`]. Inputs are only
//! unlinked after every output has been published.
//!
//! Repacking never changes what a lookup returns; it only bounds the
//! number of files a lookup has to consult.

pub mod error;
pub mod repack;

pub use error::{RepackError, RepackResult};
pub use repack::{RepackOptions, RepackReport, Repacker, REPACK_LOCK};
