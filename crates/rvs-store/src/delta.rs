//! Delta encoding and delta-chain resolution.
//!
//! An mpatch delta is a sequence of hunks:
//!
//! ```text
//! [start: u32 BE][end: u32 BE][len: u32 BE][len bytes]
//! ```
//!
//! Each hunk replaces `base[start..end]` with the given bytes. Hunks are
//! sorted and never overlap.

use rvs_types::{ContentKey, DataContent, DataEntry, DeltaAlgorithm};
use similar::{Algorithm, DiffTag};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::DataStore;

/// Default bound on delta chain length during resolution.
pub const DEFAULT_MAX_DEPTH: usize = 32;

const HUNK_HEADER: usize = 12;

/// Apply `delta` to `base` with the given algorithm.
pub fn apply(algorithm: DeltaAlgorithm, base: &[u8], delta: &[u8]) -> StoreResult<Vec<u8>> {
    match algorithm {
        DeltaAlgorithm::Mpatch => apply_mpatch(base, delta),
    }
}

/// Compute an mpatch delta turning `base` into `target`.
pub fn diff(base: &[u8], target: &[u8]) -> Vec<u8> {
    let ops = similar::capture_diff_slices(Algorithm::Myers, base, target);

    let mut hunks: Vec<(usize, usize, Vec<u8>)> = Vec::new();
    for op in ops {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        match hunks.last_mut() {
            Some((_, end, data)) if *end == old.start => {
                *end = old.end;
                data.extend_from_slice(&target[new]);
            }
            _ => hunks.push((old.start, old.end, target[new].to_vec())),
        }
    }

    let mut out = Vec::new();
    for (start, end, data) in hunks {
        out.extend_from_slice(&(start as u32).to_be_bytes());
        out.extend_from_slice(&(end as u32).to_be_bytes());
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(&data);
    }
    out
}

fn apply_mpatch(base: &[u8], delta: &[u8]) -> StoreResult<Vec<u8>> {
    let mut out = Vec::with_capacity(base.len() + delta.len());
    let mut last = 0usize;
    let mut pos = 0usize;

    while pos < delta.len() {
        if delta.len() - pos < HUNK_HEADER {
            return Err(StoreError::InvalidDelta("truncated hunk header".into()));
        }
        let start = read_u32(&delta[pos..]) as usize;
        let end = read_u32(&delta[pos + 4..]) as usize;
        let len = read_u32(&delta[pos + 8..]) as usize;
        pos += HUNK_HEADER;

        if start < last || end < start || end > base.len() {
            return Err(StoreError::InvalidDelta(format!(
                "hunk {start}..{end} out of order or beyond base of {} bytes",
                base.len()
            )));
        }
        if delta.len() - pos < len {
            return Err(StoreError::InvalidDelta("truncated hunk data".into()));
        }

        out.extend_from_slice(&base[last..start]);
        out.extend_from_slice(&delta[pos..pos + len]);
        pos += len;
        last = end;
    }

    out.extend_from_slice(&base[last..]);
    Ok(out)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Produce the full text of `entry` (stored under `key`), following delta
/// bases through `store`.
///
/// A base that cannot be found, or a chain longer than `max_depth`, is
/// corruption: the entry exists but cannot be materialized.
pub fn resolve_entry<S: DataStore + ?Sized>(
    store: &S,
    key: &ContentKey,
    entry: DataEntry,
    max_depth: usize,
) -> StoreResult<Vec<u8>> {
    let mut pending: Vec<(DeltaAlgorithm, Vec<u8>)> = Vec::new();
    let mut current_key = key.clone();
    let mut current = entry;

    loop {
        match current.content {
            DataContent::Full(text) => {
                let mut text = text;
                for (algorithm, delta) in pending.iter().rev() {
                    text = apply(*algorithm, &text, delta)?;
                }
                if !pending.is_empty() {
                    debug!(%key, links = pending.len(), bytes = text.len(), "resolved delta chain");
                }
                return Ok(text);
            }
            DataContent::Delta {
                base,
                algorithm,
                data,
            } => {
                if pending.len() >= max_depth {
                    return Err(StoreError::DeltaChainTooDeep {
                        key: key.clone(),
                        limit: max_depth,
                    });
                }
                pending.push((algorithm, data));
                current = store
                    .get_entry(&base)?
                    .ok_or_else(|| {
                        debug!(key = %current_key, %base, "delta base not found");
                        StoreError::MissingDeltaBase {
                            key: current_key.clone(),
                            base: base.clone(),
                        }
                    })?;
                current_key = base;
            }
        }
    }
}

/// Full text of `key`, or `None` when the store does not have it.
pub fn resolve<S: DataStore + ?Sized>(
    store: &S,
    key: &ContentKey,
    max_depth: usize,
) -> StoreResult<Option<Vec<u8>>> {
    match store.get_entry(key)? {
        Some(entry) => resolve_entry(store, key, entry, max_depth).map(Some),
        None => Ok(None),
    }
}

/// Number of delta links between `entry` and a full text.
///
/// Stops counting at `limit` and returns it; a missing base is an error.
pub fn chain_depth<S: DataStore + ?Sized>(
    store: &S,
    key: &ContentKey,
    entry: &DataEntry,
    limit: usize,
) -> StoreResult<usize> {
    let mut depth = 0;
    let mut current_key = key.clone();
    let mut base = entry.delta_base().cloned();

    while let Some(next) = base {
        depth += 1;
        if depth >= limit {
            return Ok(limit);
        }
        let entry = store
            .get_entry(&next)?
            .ok_or_else(|| StoreError::MissingDeltaBase {
                key: current_key.clone(),
                base: next.clone(),
            })?;
        base = entry.delta_base().cloned();
        current_key = next;
    }
    Ok(depth)
}
