use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use rvs_types::ContentKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LogError, LogResult};
use crate::segment::{self, encode_frame, FrameReader};

/// Name of the writer lock file inside a log directory.
pub const LOCK_FILE: &str = "lock";

/// When appended records are forced to stable storage.
///
/// Records always reach the OS on append, so other processes see them
/// immediately; the mode only decides when `fsync` runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every append.
    EveryAppend,
    /// `fsync` on [`IndexedLog::flush`], rotation and drop.
    #[default]
    Batched,
}

/// Configuration for an indexed log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Rotate to a new segment once the active one reaches this size.
    pub max_segment_size: u64,
    /// Keep at most this many segments, deleting the oldest on rotation.
    /// `None` keeps everything.
    pub max_segments: Option<usize>,
    pub sync_mode: SyncMode,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024, // 64 MiB
            max_segments: None,
            sync_mode: SyncMode::default(),
        }
    }
}

/// Where a record lives. Ordering follows write order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Location {
    segment: u64,
    offset: u64,
}

struct Segment {
    path: PathBuf,
    /// Bytes indexed so far.
    indexed_len: u64,
    reader: Mutex<File>,
}

struct ActiveWriter {
    segment: u64,
    writer: BufWriter<File>,
    offset: u64,
    unsynced: bool,
}

struct LogState {
    index: HashMap<ContentKey, Location>,
    segments: BTreeMap<u64, Segment>,
    writer: Option<ActiveWriter>,
}

impl LogState {
    fn newest(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    fn record(&mut self, key: ContentKey, location: Location) {
        let slot = self.index.entry(key).or_insert(location);
        if location > *slot {
            *slot = location;
        }
    }

    fn forget_segment(&mut self, id: u64) {
        self.segments.remove(&id);
        self.index.retain(|_, loc| loc.segment != id);
    }
}

/// A sealed segment as seen by the repacker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: u64,
    pub path: PathBuf,
    pub len: u64,
}

/// Append-only, crash-recoverable key/value log with an in-memory index.
///
/// Records are bincode-encoded `(ContentKey, V)` pairs framed with a
/// length and CRC32 (see [`crate::segment`]). On open every segment is
/// scanned to rebuild the index; a torn tail on the active segment is
/// truncated away. The last record written for a key wins.
///
/// One process at a time holds the writer lock. Other handles open
/// read-only and pick up new records with [`IndexedLog::refresh`].
pub struct IndexedLog<V> {
    dir: PathBuf,
    config: LogConfig,
    lock: Option<File>,
    state: RwLock<LogState>,
    _value: PhantomData<fn() -> V>,
}

impl<V> IndexedLog<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Open (or create) the log in `dir`, taking the writer lock when it
    /// is free and falling back to read-only otherwise.
    pub fn open(dir: &Path, config: LogConfig) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        let lock = match lock_file.try_lock_exclusive() {
            Ok(()) => Some(lock_file),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                debug!(dir = %dir.display(), "log writer lock held elsewhere; opening read-only");
                None
            }
            Err(e) => return Err(e.into()),
        };
        Self::open_inner(dir, config, lock)
    }

    /// Open without attempting to take the writer lock.
    pub fn open_read_only(dir: &Path, config: LogConfig) -> LogResult<Self> {
        fs::create_dir_all(dir)?;
        Self::open_inner(dir, config, None)
    }

    fn open_inner(dir: &Path, config: LogConfig, lock: Option<File>) -> LogResult<Self> {
        let log = Self {
            dir: dir.to_path_buf(),
            config,
            lock,
            state: RwLock::new(LogState {
                index: HashMap::new(),
                segments: BTreeMap::new(),
                writer: None,
            }),
            _value: PhantomData,
        };

        let ids = segment::list_segments(dir)?;
        {
            let mut state = log.state.write();
            let newest = ids.last().copied();
            for id in ids {
                let recover = log.is_writer() && Some(id) == newest;
                log.index_segment(&mut state, id, recover)?;
            }
            if log.is_writer() {
                let id = match newest {
                    Some(id) => id,
                    None => {
                        log.create_segment(&mut state, 1)?;
                        1
                    }
                };
                log.open_writer(&mut state, id)?;
            }
            debug!(
                dir = %dir.display(),
                segments = state.segments.len(),
                keys = state.index.len(),
                writable = log.is_writer(),
                "opened indexed log"
            );
        }
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether this handle holds the writer lock.
    pub fn is_writer(&self) -> bool {
        self.lock.is_some()
    }

    /// Index records of segment `id` past what is already indexed.
    /// With `recover`, a torn tail is cut off the file.
    fn index_segment(&self, state: &mut LogState, id: u64, recover: bool) -> LogResult<()> {
        let path = segment::segment_path(&self.dir, id);
        let start = state.segments.get(&id).map(|s| s.indexed_len).unwrap_or(0);
        let mut reader = match FrameReader::open(&path, id, start) {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for frame in reader.by_ref() {
            match frame {
                Ok(frame) => match decode::<V>(&frame.payload) {
                    Ok((key, _)) => found.push((
                        key,
                        Location {
                            segment: id,
                            offset: frame.offset,
                        },
                    )),
                    Err(e) => warn!(segment = id, offset = frame.offset, error = %e, "skipping undecodable log record"),
                },
                Err(LogError::Io(e)) => return Err(e.into()),
                Err(e @ LogError::TornTail { .. }) => {
                    debug!(segment = id, error = %e, "stopped at incomplete tail");
                }
                Err(e) => warn!(segment = id, error = %e, "skipping corrupt log record"),
            }
        }

        let valid_len = reader.valid_len();
        if recover && reader.is_torn() {
            warn!(
                segment = id,
                valid_len,
                file_len = reader.file_len(),
                "truncating torn tail of active segment"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        if !state.segments.contains_key(&id) {
            let reader = File::open(&path)?;
            state.segments.insert(
                id,
                Segment {
                    path,
                    indexed_len: 0,
                    reader: Mutex::new(reader),
                },
            );
        }
        if let Some(segment) = state.segments.get_mut(&id) {
            segment.indexed_len = valid_len;
        }
        for (key, location) in found {
            state.record(key, location);
        }
        Ok(())
    }

    fn create_segment(&self, state: &mut LogState, id: u64) -> LogResult<()> {
        let path = segment::segment_path(&self.dir, id);
        OpenOptions::new().create(true).append(true).open(&path)?;
        let reader = File::open(&path)?;
        state.segments.insert(
            id,
            Segment {
                path,
                indexed_len: 0,
                reader: Mutex::new(reader),
            },
        );
        Ok(())
    }

    fn open_writer(&self, state: &mut LogState, id: u64) -> LogResult<()> {
        let path = segment::segment_path(&self.dir, id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();
        state.writer = Some(ActiveWriter {
            segment: id,
            writer: BufWriter::new(file),
            offset,
            unsynced: false,
        });
        Ok(())
    }

    /// Append a record. Returns the `(segment, offset)` it was written at.
    pub fn append(&self, key: &ContentKey, value: &V) -> LogResult<(u64, u64)> {
        if !self.is_writer() {
            return Err(LogError::LockContention(self.dir.join(LOCK_FILE)));
        }
        let payload = bincode::serialize(&(key, value))
            .map_err(|e| LogError::Serialization(e.to_string()))?;
        let frame = encode_frame(&payload);

        let mut state = self.state.write();
        let needs_rotation = match &state.writer {
            Some(w) => w.offset > 0 && w.offset + frame.len() as u64 > self.config.max_segment_size,
            None => return Err(LogError::LockContention(self.dir.join(LOCK_FILE))),
        };
        if needs_rotation {
            self.rotate(&mut state)?;
        }

        let w = state
            .writer
            .as_mut()
            .ok_or_else(|| LogError::LockContention(self.dir.join(LOCK_FILE)))?;
        let location = Location {
            segment: w.segment,
            offset: w.offset,
        };
        w.writer.write_all(&frame)?;
        w.writer.flush()?;
        if self.config.sync_mode == SyncMode::EveryAppend {
            w.writer.get_ref().sync_data()?;
        } else {
            w.unsynced = true;
        }
        w.offset += frame.len() as u64;
        let end = w.offset;

        if let Some(segment) = state.segments.get_mut(&location.segment) {
            segment.indexed_len = end;
        }
        state.record(key.clone(), location);

        debug!(segment = location.segment, offset = location.offset, len = payload.len(), "log append");
        Ok((location.segment, location.offset))
    }

    fn rotate(&self, state: &mut LogState) -> LogResult<()> {
        let Some(mut old) = state.writer.take() else {
            return Ok(());
        };
        old.writer.flush()?;
        old.writer.get_ref().sync_all()?;
        let next = old.segment + 1;
        self.create_segment(state, next)?;
        self.open_writer(state, next)?;
        debug!(sealed = old.segment, active = next, "rotated log segment");

        if let Some(max) = self.config.max_segments {
            while state.segments.len() > max.max(1) {
                let Some(oldest) = state.segments.keys().next().copied() else {
                    break;
                };
                if Some(oldest) == state.newest() {
                    break;
                }
                self.unlink_segment(state, oldest)?;
                debug!(segment = oldest, "dropped oldest log segment");
            }
        }
        Ok(())
    }

    fn unlink_segment(&self, state: &mut LogState, id: u64) -> LogResult<()> {
        let path = segment::segment_path(&self.dir, id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.forget_segment(id);
        Ok(())
    }

    /// Look up the newest record for `key`.
    pub fn get(&self, key: &ContentKey) -> LogResult<Option<V>> {
        let state = self.state.read();
        let Some(location) = state.index.get(key).copied() else {
            return Ok(None);
        };
        let Some(segment) = state.segments.get(&location.segment) else {
            return Ok(None);
        };
        let payload = {
            let mut file = segment.reader.lock();
            segment::read_frame_at(&mut file, location.segment, location.offset)?
        };
        let (stored_key, value) = decode::<V>(&payload)?;
        if &stored_key != key {
            return Err(LogError::Corrupt {
                segment: location.segment,
                offset: location.offset,
                reason: format!("record holds {stored_key}, index expects {key}"),
            });
        }
        Ok(Some(value))
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.state.read().index.contains_key(key)
    }

    /// Number of distinct keys indexed.
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().index.is_empty()
    }

    /// Flush buffered writes and `fsync` the active segment.
    pub fn flush(&self) -> LogResult<()> {
        let mut state = self.state.write();
        if let Some(w) = state.writer.as_mut() {
            w.writer.flush()?;
            if w.unsynced {
                w.writer.get_ref().sync_data()?;
                w.unsynced = false;
            }
        }
        Ok(())
    }

    /// Index records appended by other processes and forget segments
    /// that were removed (for example by a repack).
    pub fn refresh(&self) -> LogResult<()> {
        let on_disk = segment::list_segments(&self.dir)?;
        let mut state = self.state.write();

        let gone: Vec<u64> = state
            .segments
            .keys()
            .copied()
            .filter(|id| on_disk.binary_search(id).is_err())
            .collect();
        for id in gone {
            if state.writer.as_ref().map(|w| w.segment) == Some(id) {
                continue;
            }
            debug!(segment = id, "log segment removed externally");
            state.forget_segment(id);
        }

        let active = state.writer.as_ref().map(|w| w.segment);
        for id in on_disk {
            if Some(id) == active {
                continue;
            }
            self.index_segment(&mut state, id, false)?;
        }
        Ok(())
    }

    /// Every segment except the newest, which may still receive appends.
    pub fn sealed_segments(&self) -> Vec<SegmentInfo> {
        let state = self.state.read();
        let newest = state.newest();
        state
            .segments
            .iter()
            .filter(|(id, _)| Some(**id) != newest)
            .map(|(id, s)| SegmentInfo {
                id: *id,
                path: s.path.clone(),
                len: s.indexed_len,
            })
            .collect()
    }

    /// Seal the active segment so everything written so far becomes
    /// repackable. No-op when the active segment is empty.
    pub fn seal(&self) -> LogResult<()> {
        let mut state = self.state.write();
        if state.writer.as_ref().is_some_and(|w| w.offset > 0) {
            self.rotate(&mut state)?;
        }
        Ok(())
    }

    /// Delete sealed segments. Segments already gone are ignored; the
    /// newest segment is never removed.
    pub fn remove_segments(&self, ids: &[u64]) -> LogResult<()> {
        let mut state = self.state.write();
        let newest = state.newest();
        for &id in ids {
            if Some(id) == newest {
                return Err(LogError::ActiveSegment(id));
            }
        }
        for &id in ids {
            self.unlink_segment(&mut state, id)?;
        }
        debug!(removed = ids.len(), "removed log segments");
        Ok(())
    }

    /// Records of one segment in write order, duplicates included.
    pub fn iter_segment(&self, id: u64) -> LogResult<impl Iterator<Item = LogResult<(ContentKey, V)>>> {
        let path = segment::segment_path(&self.dir, id);
        let reader = FrameReader::open(&path, id, 0)?;
        Ok(reader.filter_map(move |frame| match frame {
            Ok(frame) => Some(decode::<V>(&frame.payload)),
            Err(LogError::TornTail { .. }) => None,
            Err(e) => Some(Err(e)),
        }))
    }

    /// Every record in write order across all segments, duplicates
    /// included. Segments are opened as the iteration reaches them; one
    /// removed in the meantime is skipped.
    pub fn iter(&self) -> impl Iterator<Item = LogResult<(ContentKey, V)>> + '_ {
        let ids: Vec<u64> = self.state.read().segments.keys().copied().collect();
        ids.into_iter().flat_map(
            move |id| -> Box<dyn Iterator<Item = LogResult<(ContentKey, V)>> + '_> {
                match self.iter_segment(id) {
                    Ok(records) => Box::new(records),
                    Err(LogError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        Box::new(std::iter::empty())
                    }
                    Err(e) => Box::new(std::iter::once(Err(e))),
                }
            },
        )
    }

    /// Total bytes across all segments.
    pub fn size_bytes(&self) -> u64 {
        self.state
            .read()
            .segments
            .values()
            .map(|s| s.indexed_len)
            .sum()
    }

    pub fn segment_count(&self) -> usize {
        self.state.read().segments.len()
    }
}

impl<V> Drop for IndexedLog<V> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(w) = state.writer.as_mut() {
            let result = w
                .writer
                .flush()
                .and_then(|()| w.writer.get_ref().sync_data());
            if let Err(e) = result {
                warn!(dir = %self.dir.display(), error = %e, "failed to flush indexed log on drop");
            }
        }
    }
}

impl<V> std::fmt::Debug for IndexedLog<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedLog")
            .field("dir", &self.dir)
            .field("writable", &self.lock.is_some())
            .finish()
    }
}

fn decode<V: DeserializeOwned>(payload: &[u8]) -> LogResult<(ContentKey, V)> {
    bincode::deserialize(payload).map_err(|e| LogError::Serialization(e.to_string()))
}
