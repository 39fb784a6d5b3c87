//! Store capabilities for the revision store.
//!
//! Every concrete store (pack directory, indexed log, write buffer, remote
//! adapter) implements the same small set of traits so the fallback chain
//! can compose them without knowing what they are.
//!
//! # Design Rules
//!
//! 1. `Ok(None)` means "not here"; it is never an error.
//! 2. Corruption is an error ([`StoreError::is_corrupt`]) and is never
//!    folded into a not-found result.
//! 3. Entries are returned raw. Delta chains are resolved by [`delta::resolve`]
//!    against whatever store the caller hands it, usually the whole chain.
//! 4. Iteration ([`Repackable`]) is lazy, finite and restarts from the
//!    beginning on every call.

pub mod codec;
pub mod delta;
pub mod error;
pub mod memory;
pub mod traits;

pub use codec::{codec_for, Codec};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use traits::{
    DataIter, DataStore, HistoryIter, HistoryStore, MutableDataStore, MutableHistoryStore,
    Repackable,
};
