//! Fallback chain for the revision store.
//!
//! A [`UnionStore`] queries an ordered list of stores and returns the first
//! answer. Typical order:
//!
//! ```text
//! write buffer -> local logs -> local packs -> shared logs -> shared packs -> remote
//! ```
//!
//! Anything found in a shared cache or on the remote is written back to a
//! local store. Keys the local stores cannot answer go to the remote as one
//! batched request through a [`RemoteBridge`], which bounds the request with
//! a timeout and turns failures into missing keys plus a recorded
//! [`StoreFailure`].

pub mod remote;
pub mod types;
pub mod union;

pub use remote::{FetchResult, RemoteBridge, RemoteStore, StoreRemote};
pub use types::{BatchResult, FailureKind, StoreFailure, StoreTier, UnionOptions};
pub use union::{ChainValue, UnionDataStore, UnionHistoryStore, UnionStore};
