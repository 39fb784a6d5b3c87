use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, RwLock};
use rvs_store::{DataStore, HistoryStore, Repackable, StoreError, StoreResult};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};
use tracing::{debug, warn};

use crate::datapack::DataPack;
use crate::error::{PackError, PackResult};
use crate::format::PackKind;
use crate::historypack::HistoryPack;
use crate::pack::{PackOpenOptions, PackPaths};

/// Subdirectory that receives quarantined packs.
pub const CORRUPT_DIR: &str = "corrupt";

/// Minimum time between checks, on a miss, for unlinked snapshot packs.
pub const STALE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// A pack type a [`PackStore`] can manage.
pub trait PackFormat: Send + Sync + Sized {
    const KIND: PackKind;

    fn open_pack(path: &Path, options: &PackOpenOptions) -> PackResult<Self>;

    fn pack_paths(&self) -> &PackPaths;

    fn entry_count(&self) -> usize;

    fn bytes(&self) -> u64;
}

impl PackFormat for DataPack {
    const KIND: PackKind = PackKind::Data;

    fn open_pack(path: &Path, options: &PackOpenOptions) -> PackResult<Self> {
        DataPack::open_with(path, options)
    }

    fn pack_paths(&self) -> &PackPaths {
        self.paths()
    }

    fn entry_count(&self) -> usize {
        self.len()
    }

    fn bytes(&self) -> u64 {
        Repackable::size_bytes(self)
    }
}

impl PackFormat for HistoryPack {
    const KIND: PackKind = PackKind::History;

    fn open_pack(path: &Path, options: &PackOpenOptions) -> PackResult<Self> {
        HistoryPack::open_with(path, options)
    }

    fn pack_paths(&self) -> &PackPaths {
        self.paths()
    }

    fn entry_count(&self) -> usize {
        self.len()
    }

    fn bytes(&self) -> u64 {
        Repackable::size_bytes(self)
    }
}

/// A pack that failed to open.
#[derive(Clone, Debug)]
pub struct CorruptPack {
    pub paths: PackPaths,
    pub reason: String,
}

struct PackSet<P> {
    /// Newest first.
    packs: Vec<Arc<P>>,
    corrupt: Vec<CorruptPack>,
}

/// All packs of one kind in a directory.
///
/// The set is a snapshot taken at open or [`PackStore::rescan`]. Packs
/// published by other processes appear on the next rescan. A lookup that
/// misses while some snapshot pack has been unlinked rescans and retries
/// once; misses look for unlinked packs at most once per
/// [`STALE_CHECK_INTERVAL`].
pub struct PackStore<P> {
    dir: PathBuf,
    options: PackOpenOptions,
    state: RwLock<PackSet<P>>,
    last_stale_check: Mutex<Option<Instant>>,
}

pub type DataPackStore = PackStore<DataPack>;
pub type HistoryPackStore = PackStore<HistoryPack>;

impl<P: PackFormat> PackStore<P> {
    pub fn open(dir: &Path) -> PackResult<Self> {
        Self::open_with(dir, PackOpenOptions::default())
    }

    pub fn open_with(dir: &Path, options: PackOpenOptions) -> PackResult<Self> {
        std::fs::create_dir_all(dir)?;
        let store = Self {
            dir: dir.to_path_buf(),
            options,
            state: RwLock::new(PackSet {
                packs: Vec::new(),
                corrupt: Vec::new(),
            }),
            last_stale_check: Mutex::new(None),
        };
        store.rescan()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-read the directory. Already-open packs are kept; new ones are
    /// opened; packs whose files are gone are dropped.
    pub fn rescan(&self) -> PackResult<()> {
        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_body = path
                .extension()
                .map(|ext| ext == P::KIND.body_extension())
                .unwrap_or(false);
            let is_temp = entry.file_name().to_string_lossy().starts_with('.');
            if !is_body || is_temp {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(time) => time,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            found.push((modified, path));
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let previous = self.packs();
        let mut packs = Vec::with_capacity(found.len());
        let mut corrupt = Vec::new();
        for (_, path) in found {
            if let Some(open) = previous.iter().find(|p| p.pack_paths().body == path) {
                packs.push(Arc::clone(open));
                continue;
            }
            match P::open_pack(&path, &self.options) {
                Ok(pack) if pack.entry_count() == 0 => {
                    debug!(pack = %path.display(), "skipping empty pack");
                }
                Ok(pack) => packs.push(Arc::new(pack)),
                Err(PackError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(pack = %path.display(), "pack vanished during scan");
                }
                Err(e) => {
                    warn!(pack = %path.display(), error = %e, "skipping corrupt pack");
                    corrupt.push(CorruptPack {
                        paths: PackPaths::for_kind(P::KIND, &path),
                        reason: e.to_string(),
                    });
                }
            }
        }

        debug!(dir = %self.dir.display(), packs = packs.len(), "scanned pack directory");
        let mut state = self.state.write();
        state.packs = packs;
        state.corrupt = corrupt;
        Ok(())
    }

    /// Open packs, newest first.
    pub fn packs(&self) -> Vec<Arc<P>> {
        self.state.read().packs.clone()
    }

    pub fn pack_count(&self) -> usize {
        self.state.read().packs.len()
    }

    pub fn entry_count(&self) -> usize {
        self.state.read().packs.iter().map(|p| p.entry_count()).sum()
    }

    pub fn size_bytes(&self) -> u64 {
        self.state.read().packs.iter().map(|p| p.bytes()).sum()
    }

    /// Packs that failed validation on the last scan.
    pub fn corrupt_packs(&self) -> Vec<CorruptPack> {
        self.state.read().corrupt.clone()
    }

    /// Move every corrupt pack into the `corrupt/` subdirectory so later
    /// scans stop tripping over it. Returns how many packs were moved.
    pub fn quarantine_corrupt(&self) -> PackResult<usize> {
        let corrupt = std::mem::take(&mut self.state.write().corrupt);
        if corrupt.is_empty() {
            return Ok(0);
        }
        let target = self.dir.join(CORRUPT_DIR);
        std::fs::create_dir_all(&target)?;
        let mut moved = 0;
        for pack in &corrupt {
            let mut any = false;
            for path in [&pack.paths.body, &pack.paths.index] {
                let Some(name) = path.file_name() else {
                    continue;
                };
                match std::fs::rename(path, target.join(name)) {
                    Ok(()) => any = true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if any {
                warn!(pack = %pack.paths.body.display(), reason = %pack.reason, "quarantined corrupt pack");
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Packs as repack inputs, oldest first so later inputs win.
    pub fn repack_inputs(&self) -> Vec<Arc<dyn Repackable>>
    where
        P: Repackable + 'static,
    {
        self.packs()
            .into_iter()
            .rev()
            .map(|p| p as Arc<dyn Repackable>)
            .collect()
    }

    fn snapshot_is_stale(&self) -> bool {
        {
            let mut last = self.last_stale_check.lock();
            if last.is_some_and(|at| at.elapsed() < STALE_CHECK_INTERVAL) {
                return false;
            }
            *last = Some(Instant::now());
        }
        self.state
            .read()
            .packs
            .iter()
            .any(|p| !p.pack_paths().body.exists())
    }

    /// Run `read` against each pack, newest first.
    ///
    /// A corrupt record does not hide the key in older packs; its error
    /// is only returned when no pack produced the key.
    fn lookup<T>(
        &self,
        key: &ContentKey,
        read: impl Fn(&P, &ContentKey) -> StoreResult<Option<T>>,
    ) -> StoreResult<Option<T>> {
        let mut retried = false;
        loop {
            let mut first_error: Option<StoreError> = None;
            let mut vanished = false;
            for pack in self.packs() {
                match read(pack.as_ref(), key) {
                    Ok(Some(value)) => return Ok(Some(value)),
                    Ok(None) => {}
                    Err(e) if e.is_vanished() => vanished = true,
                    Err(e) => {
                        warn!(pack = %pack.pack_paths().body.display(), %key, error = %e, "pack read failed");
                        first_error.get_or_insert(e);
                    }
                }
            }
            if !retried && (vanished || self.snapshot_is_stale()) {
                retried = true;
                self.rescan()?;
                continue;
            }
            return match first_error {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }
    }
}

impl DataStore for PackStore<DataPack> {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        self.lookup(key, |pack, key| pack.get_entry(key))
    }

    fn contains(&self, key: &ContentKey) -> StoreResult<bool> {
        if self.state.read().packs.iter().any(|p| p.index().contains(key)) {
            return Ok(true);
        }
        Ok(self.get_entry(key)?.is_some())
    }

    fn describe(&self) -> String {
        format!("datapacks {}", self.dir.display())
    }
}

impl HistoryStore for PackStore<HistoryPack> {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        self.lookup(key, |pack, key| pack.get_history(key))
    }

    fn describe(&self) -> String {
        format!("histpacks {}", self.dir.display())
    }
}

impl<P> std::fmt::Debug for PackStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackStore")
            .field("dir", &self.dir)
            .field("packs", &self.state.read().packs.len())
            .finish()
    }
}
