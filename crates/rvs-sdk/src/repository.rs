use std::path::{Path, PathBuf};
use std::sync::Arc;

use rvs_log::{IndexedLogDataStore, IndexedLogHistoryStore, DATA_LOG_DIR, HISTORY_LOG_DIR};
use rvs_pack::{DataPackStore, HistoryPackStore, PackOpenOptions};
use rvs_repack::{RepackReport, Repacker, REPACK_LOCK};
use rvs_store::{DataStore, HistoryStore, MutableDataStore, MutableHistoryStore, Repackable};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};
use rvs_union::{
    BatchResult, RemoteBridge, RemoteStore, StoreTier, UnionDataStore, UnionHistoryStore,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::buffer::{BufferTargets, Finalized, WriteBack, WriteBuffer};
use crate::config::StoreConfig;
use crate::error::{SdkError, SdkResult};

/// Directory holding the packs of a store root.
pub const PACK_DIR: &str = "packs";

/// The logs and packs under one store root.
struct StoreRoot {
    path: PathBuf,
    tier: StoreTier,
    data_log: Arc<IndexedLogDataStore>,
    history_log: Arc<IndexedLogHistoryStore>,
    data_packs: Arc<DataPackStore>,
    history_packs: Arc<HistoryPackStore>,
}

impl StoreRoot {
    fn open(path: &Path, tier: StoreTier, config: &StoreConfig) -> SdkResult<Self> {
        std::fs::create_dir_all(path)?;
        let options = PackOpenOptions {
            verify_body: config.pack.verify_on_open,
        };
        let pack_dir = path.join(PACK_DIR);
        let data_packs = DataPackStore::open_with(&pack_dir, options.clone())?;
        let history_packs = HistoryPackStore::open_with(&pack_dir, options)?;
        if config.pack.quarantine_corrupt {
            data_packs.quarantine_corrupt()?;
            history_packs.quarantine_corrupt()?;
        }
        let data_log = IndexedLogDataStore::open(&path.join(DATA_LOG_DIR), config.log.clone())?;
        let history_log =
            IndexedLogHistoryStore::open(&path.join(HISTORY_LOG_DIR), config.log.clone())?;
        debug!(
            root = %path.display(),
            ?tier,
            data_packs = data_packs.pack_count(),
            history_packs = history_packs.pack_count(),
            log_writer = data_log.log().is_writer(),
            "opened store root"
        );
        Ok(Self {
            path: path.to_path_buf(),
            tier,
            data_log: Arc::new(data_log),
            history_log: Arc::new(history_log),
            data_packs: Arc::new(data_packs),
            history_packs: Arc::new(history_packs),
        })
    }

    fn rescan(&self) -> SdkResult<()> {
        self.data_packs.rescan()?;
        self.history_packs.rescan()?;
        self.data_log.log().refresh()?;
        self.history_log.log().refresh()?;
        Ok(())
    }

    /// Packs oldest first, then sealed log segments.
    fn repack_inputs(&self) -> SdkResult<Vec<Arc<dyn Repackable>>> {
        // Seal the active segments so their records are repacked too.
        // A read-only handle has nothing to seal.
        self.data_log.log().seal()?;
        self.history_log.log().seal()?;

        let mut inputs = self.data_packs.repack_inputs();
        inputs.extend(self.history_packs.repack_inputs());
        if let Some(segments) = self.data_log.repack_input() {
            inputs.push(Arc::new(segments));
        }
        if let Some(segments) = self.history_log.repack_input() {
            inputs.push(Arc::new(segments));
        }
        Ok(inputs)
    }

    fn stats(&self) -> RootStats {
        RootStats {
            path: self.path.clone(),
            tier: self.tier,
            data_packs: self.data_packs.pack_count(),
            history_packs: self.history_packs.pack_count(),
            pack_entries: self.data_packs.entry_count() + self.history_packs.entry_count(),
            pack_bytes: self.data_packs.size_bytes() + self.history_packs.size_bytes(),
            corrupt_packs: self.data_packs.corrupt_packs().len()
                + self.history_packs.corrupt_packs().len(),
            data_log_entries: self.data_log.log().len(),
            history_log_entries: self.history_log.log().len(),
            log_segments: self.data_log.log().segment_count()
                + self.history_log.log().segment_count(),
            log_bytes: self.data_log.log().size_bytes() + self.history_log.log().size_bytes(),
            log_writer: self.data_log.log().is_writer(),
        }
    }

    fn verify(&self, report: &mut VerifyReport) {
        for pack in self.data_packs.packs() {
            report.record(&pack.paths().body, pack.verify());
        }
        for pack in self.history_packs.packs() {
            report.record(&pack.paths().body, pack.verify());
        }
        for corrupt in self
            .data_packs
            .corrupt_packs()
            .into_iter()
            .chain(self.history_packs.corrupt_packs())
        {
            report.problems.push(VerifyProblem {
                path: corrupt.paths.body,
                reason: corrupt.reason,
            });
        }
    }
}

/// Counters for one store root.
#[derive(Clone, Debug, Serialize)]
pub struct RootStats {
    pub path: PathBuf,
    pub tier: StoreTier,
    pub data_packs: usize,
    pub history_packs: usize,
    pub pack_entries: usize,
    pub pack_bytes: u64,
    pub corrupt_packs: usize,
    pub data_log_entries: usize,
    pub history_log_entries: usize,
    pub log_segments: usize,
    pub log_bytes: u64,
    /// Whether this process holds the log writer lock.
    pub log_writer: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    pub buffered: usize,
    pub chain: Vec<String>,
    pub roots: Vec<RootStats>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VerifyProblem {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of a full pack verification.
#[derive(Clone, Debug, Default, Serialize)]
pub struct VerifyReport {
    pub packs_checked: usize,
    pub entries_checked: usize,
    pub problems: Vec<VerifyProblem>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn record(&mut self, path: &Path, result: rvs_pack::PackResult<usize>) {
        self.packs_checked += 1;
        match result {
            Ok(entries) => self.entries_checked += entries,
            Err(e) => self.problems.push(VerifyProblem {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Repack results per store root.
#[derive(Clone, Debug, Serialize)]
pub struct RepackSummary {
    pub local: RepackReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared: Option<RepackReport>,
}

/// A revision store: write buffer, local and shared roots, and an
/// optional remote, composed into one fallback chain.
///
/// Lookup order is the write buffer, the local data log, the local packs,
/// then the shared log and packs, then the remote. Entries found in the
/// shared root or on the remote are written back into the local logs, or
/// into the write buffer when another process holds the log lock.
///
/// Dropping the store finalizes anything still buffered.
pub struct RevisionStore {
    config: StoreConfig,
    buffer: Arc<WriteBuffer>,
    local: StoreRoot,
    shared: Option<StoreRoot>,
    data: Arc<UnionDataStore>,
    history: Arc<UnionHistoryStore>,
}

impl RevisionStore {
    /// Open the roots named by `config` and build the fallback chain.
    ///
    /// A shared root that cannot be opened is left out with a warning.
    pub fn open(config: StoreConfig, remote: Option<Arc<dyn RemoteStore>>) -> SdkResult<Self> {
        config.validate()?;
        let local = StoreRoot::open(&config.local_path, StoreTier::Local, &config)?;
        let shared = match &config.cache_path {
            Some(path) => match StoreRoot::open(path, StoreTier::Shared, &config) {
                Ok(root) => Some(root),
                Err(e) => {
                    warn!(root = %path.display(), error = %e, "shared cache unavailable; skipping");
                    None
                }
            },
            None => None,
        };
        let remote = match remote {
            Some(remote) => Some(Arc::new(RemoteBridge::new(remote, config.remote.timeout())?)),
            None => None,
        };

        let buffer = Arc::new(WriteBuffer::new(
            BufferTargets {
                data_log: local.data_log.clone(),
                history_log: local.history_log.clone(),
                data_packs: local.data_packs.clone(),
                history_packs: local.history_packs.clone(),
            },
            &config.buffer,
        ));

        let write_back = Arc::new(WriteBack::new(buffer.clone()));
        let mut data = UnionDataStore::new()
            .with_options(config.remote.union_options())
            .with_member(StoreTier::Local, buffer.clone())
            .with_write_back(write_back.clone());
        let mut history = UnionHistoryStore::new()
            .with_options(config.remote.union_options())
            .with_member(StoreTier::Local, buffer.clone())
            .with_write_back(write_back);
        for root in std::iter::once(&local).chain(shared.as_ref()) {
            data = data
                .with_member(root.tier, root.data_log.clone())
                .with_member(root.tier, root.data_packs.clone());
            history = history
                .with_member(root.tier, root.history_log.clone())
                .with_member(root.tier, root.history_packs.clone());
        }
        if let Some(remote) = remote {
            data = data.with_remote(remote.clone());
            history = history.with_remote(remote);
        }
        info!(chain = ?data.member_names(), "revision store ready");

        Ok(Self {
            config,
            buffer,
            local,
            shared,
            data: Arc::new(data),
            history: Arc::new(history),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The data chain, for callers that want raw entries or batch
    /// failures, or want to serve this store to another one.
    pub fn data_chain(&self) -> &Arc<UnionDataStore> {
        &self.data
    }

    pub fn history_chain(&self) -> &Arc<UnionHistoryStore> {
        &self.history
    }

    /// Full text of `key`, delta chains resolved.
    pub fn get(&self, key: &ContentKey) -> SdkResult<Option<Vec<u8>>> {
        Ok(self.data.get_full(key)?)
    }

    /// Like [`get`](Self::get), but absence is an error.
    pub fn require(&self, key: &ContentKey) -> SdkResult<Vec<u8>> {
        self.get(key)?.ok_or_else(|| SdkError::NotFound(key.clone()))
    }

    /// The entry for `key` as stored, possibly a delta.
    pub fn get_entry(&self, key: &ContentKey) -> SdkResult<Option<DataEntry>> {
        Ok(self.data.get_single(key)?)
    }

    /// Full texts of a batch of keys. Never fails as a whole: unanswered
    /// keys are in `missing` and the reasons in `failures`.
    pub fn get_batch(&self, keys: &[ContentKey]) -> BatchResult<Vec<u8>> {
        self.data.get_full_batch(keys)
    }

    pub fn get_history(&self, key: &ContentKey) -> SdkResult<Option<HistoryEntry>> {
        Ok(self.history.get_single(key)?)
    }

    pub fn get_history_batch(&self, keys: &[ContentKey]) -> BatchResult<HistoryEntry> {
        self.history.get_batch(keys)
    }

    /// Buffer a new revision. Visible to lookups immediately, durable
    /// after [`flush`](Self::flush).
    pub fn add(&self, key: &ContentKey, data: DataEntry, history: HistoryEntry) -> SdkResult<()> {
        self.buffer.add_entry(key, data, history);
        Ok(())
    }

    pub fn add_data(&self, key: &ContentKey, data: &DataEntry) -> SdkResult<()> {
        Ok(self.buffer.add(key, data)?)
    }

    pub fn add_history(&self, key: &ContentKey, history: &HistoryEntry) -> SdkResult<()> {
        Ok(self.buffer.add_history(key, history)?)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Finalize the write buffer and make the local logs durable.
    pub fn flush(&self) -> SdkResult<Finalized> {
        let outcome = self.buffer.finalize(self.config.buffer.finalize)?;
        if self.local.data_log.log().is_writer() {
            self.local.data_log.log().flush()?;
            self.local.history_log.log().flush()?;
        }
        Ok(outcome)
    }

    /// Consolidate the packs and sealed log segments of each root.
    ///
    /// The write buffer is flushed first. Content resolvable before the
    /// pass is resolvable after it.
    pub fn repack(&self) -> SdkResult<RepackSummary> {
        self.flush()?;
        let local = self.repack_root(&self.local)?;
        let shared = match &self.shared {
            Some(root) => Some(self.repack_root(root)?),
            None => None,
        };
        Ok(RepackSummary { local, shared })
    }

    fn repack_root(&self, root: &StoreRoot) -> SdkResult<RepackReport> {
        let inputs = root.repack_inputs()?;
        let data: Arc<dyn DataStore> = self.data.clone();
        let history: Arc<dyn HistoryStore> = self.history.clone();
        let report = Repacker::new(root.path.join(PACK_DIR), root.path.join(REPACK_LOCK))
            .with_options(self.config.repack.options())
            .with_resolver(data, history)
            .run(&inputs)?;
        root.rescan()?;
        Ok(report)
    }

    /// Pick up packs and log records written by other processes.
    pub fn rescan(&self) -> SdkResult<()> {
        self.local.rescan()?;
        if let Some(shared) = &self.shared {
            shared.rescan()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            buffered: self.buffer.len(),
            chain: self.data.member_names(),
            roots: self.roots().map(StoreRoot::stats).collect(),
        }
    }

    /// Check every pack body against its index and record CRCs.
    pub fn verify(&self) -> VerifyReport {
        let mut report = VerifyReport::default();
        for root in self.roots() {
            root.verify(&mut report);
        }
        report
    }

    /// Move packs that failed to open into `corrupt/`. Returns how many
    /// were moved.
    pub fn quarantine_corrupt(&self) -> SdkResult<usize> {
        let mut moved = 0;
        for root in self.roots() {
            moved += root.data_packs.quarantine_corrupt()?;
            moved += root.history_packs.quarantine_corrupt()?;
        }
        Ok(moved)
    }

    fn roots(&self) -> impl Iterator<Item = &StoreRoot> {
        std::iter::once(&self.local).chain(self.shared.as_ref())
    }
}

impl Drop for RevisionStore {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        if let Err(e) = self.buffer.finalize(self.config.buffer.finalize) {
            warn!(error = %e, "failed to finalize write buffer on close");
        }
    }
}

impl std::fmt::Debug for RevisionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionStore")
            .field("local", &self.local.path)
            .field("shared", &self.shared.as_ref().map(|s| &s.path))
            .field("buffer", &self.buffer)
            .field("chain", &self.data.member_names())
            .finish()
    }
}
