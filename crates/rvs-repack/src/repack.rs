use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use fs2::FileExt;
use rvs_pack::{data_record, history_record, PackBuilder, PackKind, PackPaths};
use rvs_store::delta;
use rvs_store::{DataStore, HistoryStore, Repackable, StoreResult};
use rvs_types::{ContentKey, DataEntry, DeltaAlgorithm};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RepackError, RepackResult};

/// Name of the lock file held while a pass publishes and unlinks.
pub const REPACK_LOCK: &str = "repack.lock";

/// Upper bound on links followed when materializing an entry for re-basing.
const RESOLVE_LIMIT: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepackOptions {
    /// Output packs roll over once their body reaches this many bytes.
    pub max_pack_size: u64,
    /// Delta chains longer than this are re-based. Zero disables re-basing.
    pub max_delta_chain: usize,
}

impl Default for RepackOptions {
    fn default() -> Self {
        Self {
            max_pack_size: 1 << 30,
            max_delta_chain: 16,
        }
    }
}

/// What a pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RepackReport {
    pub inputs: usize,
    pub inputs_removed: usize,
    pub entries_written: usize,
    pub duplicates_dropped: usize,
    pub corrupt_skipped: usize,
    pub rebased: usize,
    pub packs_written: usize,
    pub bytes_reclaimed: u64,
    pub output_packs: Vec<PathBuf>,
}

/// The winning occurrence of a key: the last one seen, inputs oldest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Winner {
    input: usize,
    ordinal: usize,
    full: bool,
}

type Winners = HashMap<ContentKey, Winner>;

/// Consolidates repackable inputs into new packs in one directory.
///
/// Inputs are given oldest first; when several hold a key, the entry from
/// the latest input wins. All outputs are published before any input is
/// unlinked, under `repack.lock`.
pub struct Repacker {
    pack_dir: PathBuf,
    lock_path: PathBuf,
    options: RepackOptions,
    data_resolver: Option<Arc<dyn DataStore>>,
    history_resolver: Option<Arc<dyn HistoryStore>>,
}

impl Repacker {
    pub fn new(pack_dir: impl Into<PathBuf>, lock_path: impl Into<PathBuf>) -> Self {
        Self {
            pack_dir: pack_dir.into(),
            lock_path: lock_path.into(),
            options: RepackOptions::default(),
            data_resolver: None,
            history_resolver: None,
        }
    }

    pub fn with_options(mut self, options: RepackOptions) -> Self {
        self.options = options;
        self
    }

    /// Stores used to measure and re-base long delta chains, normally the
    /// full fallback chain. Without them chains are copied as they are.
    pub fn with_resolver(
        mut self,
        data: Arc<dyn DataStore>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        self.data_resolver = Some(data);
        self.history_resolver = Some(history);
        self
    }

    pub fn options(&self) -> &RepackOptions {
        &self.options
    }

    pub fn run(&self, inputs: &[Arc<dyn Repackable>]) -> RepackResult<RepackReport> {
        let started = Instant::now();
        let mut report = RepackReport {
            inputs: inputs.len(),
            ..Default::default()
        };
        if inputs.is_empty() {
            return Ok(report);
        }
        std::fs::create_dir_all(&self.pack_dir)?;

        let mut unreadable = vec![false; inputs.len()];
        let data_winners = select_winners(inputs, PackKind::Data, &mut unreadable, &mut report);
        let history_winners =
            select_winners(inputs, PackKind::History, &mut unreadable, &mut report);

        let mut data_out = OutputSet::new(PackKind::Data, &self.pack_dir, self.options.max_pack_size);
        self.write_data(inputs, &data_winners, &unreadable, &mut data_out, &mut report)?;
        let mut history_out =
            OutputSet::new(PackKind::History, &self.pack_dir, self.options.max_pack_size);
        write_history(inputs, &history_winners, &unreadable, &mut history_out, &mut report)?;

        let input_files: HashSet<PathBuf> = inputs
            .iter()
            .flat_map(|input| input.backing_files())
            .collect();
        let input_bytes: u64 = inputs
            .iter()
            .zip(&unreadable)
            .filter(|(_, skip)| !**skip)
            .map(|(input, _)| input.size_bytes())
            .sum();

        let lock = self.lock()?;
        let published = publish([data_out, history_out], &input_files)?;

        let output_files: HashSet<&Path> = published
            .iter()
            .flat_map(|p| [p.body.as_path(), p.index.as_path()])
            .collect();
        for (input, skip) in inputs.iter().zip(&unreadable) {
            if *skip {
                continue;
            }
            let files = input.backing_files();
            if files.iter().any(|f| output_files.contains(f.as_path())) {
                // Rewritten to identical bytes under the same name.
                debug!(input = %input.repack_id(), "output replaced input in place");
                continue;
            }
            match input.remove() {
                Ok(()) => report.inputs_removed += 1,
                Err(e) if e.is_vanished() => {}
                Err(e) => {
                    warn!(input = %input.repack_id(), error = %e, "cannot remove repacked input");
                }
            }
        }
        drop(lock);

        let output_bytes: u64 = published.iter().map(paths_len).sum();
        report.packs_written = published.len();
        report.bytes_reclaimed = input_bytes.saturating_sub(output_bytes);
        report.output_packs = published.into_iter().map(|p| p.body).collect();

        info!(
            inputs = report.inputs,
            removed = report.inputs_removed,
            written = report.entries_written,
            duplicates = report.duplicates_dropped,
            corrupt = report.corrupt_skipped,
            rebased = report.rebased,
            packs = report.packs_written,
            reclaimed = report.bytes_reclaimed,
            elapsed = ?started.elapsed(),
            "repack complete"
        );
        Ok(report)
    }

    fn lock(&self) -> RepackResult<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                warn!(lock = %self.lock_path.display(), "repack already in progress; rolling back");
                Err(RepackError::LockContention(self.lock_path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_data(
        &self,
        inputs: &[Arc<dyn Repackable>],
        winners: &Winners,
        unreadable: &[bool],
        out: &mut OutputSet,
        report: &mut RepackReport,
    ) -> RepackResult<()> {
        let expected = winners_per_input(winners);
        for (idx, input) in inputs.iter().enumerate() {
            if unreadable[idx] {
                continue;
            }
            let iter = input.iter_data().map_err(|e| input_changed(input.as_ref(), &e))?;
            let mut written = 0;
            for (ordinal, item) in iter.enumerate() {
                let Ok((key, entry)) = item else { continue };
                if !is_winner(winners, &key, idx, ordinal) {
                    continue;
                }
                let entry = self.rebase(&key, entry, winners, report);
                out.append(&key, &data_record(&entry)?)?;
                report.entries_written += 1;
                written += 1;
            }
            check_written(input.as_ref(), written, expected.get(&idx))?;
        }
        Ok(())
    }

    /// Re-base `entry` when its delta chain is longer than allowed.
    ///
    /// The result is a delta against the history `p1` when that parent is
    /// written as full text in this pass, otherwise the full text. Entries
    /// whose chain cannot be resolved are returned unchanged.
    fn rebase(
        &self,
        key: &ContentKey,
        entry: DataEntry,
        winners: &Winners,
        report: &mut RepackReport,
    ) -> DataEntry {
        let limit = self.options.max_delta_chain;
        let Some(data) = self.data_resolver.as_deref() else {
            return entry;
        };
        if limit == 0 || entry.is_full() {
            return entry;
        }
        match delta::chain_depth(data, key, &entry, limit + 1) {
            Ok(depth) if depth <= limit => return entry,
            Ok(_) => {}
            Err(e) => {
                debug!(%key, error = %e, "delta chain unresolvable; kept as is");
                return entry;
            }
        }
        let text = match delta::resolve_entry(data, key, entry.clone(), RESOLVE_LIMIT) {
            Ok(text) => text,
            Err(e) => {
                debug!(%key, error = %e, "delta chain unresolvable; kept as is");
                return entry;
            }
        };
        report.rebased += 1;
        let compression = entry.compression;
        if let Some(p1) = self.full_parent(key, winners) {
            if let Ok(Some(base)) = delta::resolve(data, &p1, RESOLVE_LIMIT) {
                let patch = delta::diff(&base, &text);
                return DataEntry::delta(p1, DeltaAlgorithm::Mpatch, patch)
                    .with_compression(compression);
            }
        }
        DataEntry::full(text).with_compression(compression)
    }

    fn full_parent(&self, key: &ContentKey, winners: &Winners) -> Option<ContentKey> {
        let history = self.history_resolver.as_deref()?;
        let p1 = history.get_history(key).ok()??.p1?;
        let winner = winners.get(&p1)?;
        (winner.full && &p1 != key).then_some(p1)
    }
}

fn is_winner(winners: &Winners, key: &ContentKey, input: usize, ordinal: usize) -> bool {
    winners
        .get(key)
        .is_some_and(|w| w.input == input && w.ordinal == ordinal)
}

/// `(key, stored as full text)` for every record of one kind in `input`.
fn scan<'a>(
    input: &'a dyn Repackable,
    kind: PackKind,
) -> StoreResult<Box<dyn Iterator<Item = StoreResult<(ContentKey, bool)>> + 'a>> {
    Ok(match kind {
        PackKind::Data => Box::new(
            input
                .iter_data()?
                .map(|item| item.map(|(key, entry)| (key, entry.is_full()))),
        ),
        PackKind::History => Box::new(
            input
                .iter_history()?
                .map(|item| item.map(|(key, _)| (key, true))),
        ),
    })
}

/// First pass: pick the winning occurrence of every key.
fn select_winners(
    inputs: &[Arc<dyn Repackable>],
    kind: PackKind,
    unreadable: &mut [bool],
    report: &mut RepackReport,
) -> Winners {
    let mut winners = Winners::new();
    for (idx, input) in inputs.iter().enumerate() {
        if unreadable[idx] {
            continue;
        }
        let iter = match scan(input.as_ref(), kind) {
            Ok(iter) => iter,
            Err(e) => {
                if e.is_vanished() {
                    debug!(input = %input.repack_id(), "input removed by another repack");
                } else {
                    warn!(input = %input.repack_id(), error = %e, "skipping unreadable input");
                }
                unreadable[idx] = true;
                continue;
            }
        };
        for (ordinal, item) in iter.enumerate() {
            match item {
                Ok((key, full)) => {
                    let winner = Winner {
                        input: idx,
                        ordinal,
                        full,
                    };
                    if winners.insert(key, winner).is_some() {
                        report.duplicates_dropped += 1;
                    }
                }
                Err(e) => {
                    warn!(input = %input.repack_id(), error = %e, "skipping corrupt entry");
                    report.corrupt_skipped += 1;
                }
            }
        }
    }
    debug!(?kind, keys = winners.len(), "selected repack winners");
    winners
}

fn write_history(
    inputs: &[Arc<dyn Repackable>],
    winners: &Winners,
    unreadable: &[bool],
    out: &mut OutputSet,
    report: &mut RepackReport,
) -> RepackResult<()> {
    let expected = winners_per_input(winners);
    for (idx, input) in inputs.iter().enumerate() {
        if unreadable[idx] {
            continue;
        }
        let iter = input
            .iter_history()
            .map_err(|e| input_changed(input.as_ref(), &e))?;
        let mut written = 0;
        for (ordinal, item) in iter.enumerate() {
            let Ok((key, entry)) = item else { continue };
            if is_winner(winners, &key, idx, ordinal) {
                out.append(&key, &history_record(&entry)?)?;
                report.entries_written += 1;
                written += 1;
            }
        }
        check_written(input.as_ref(), written, expected.get(&idx))?;
    }
    Ok(())
}

fn winners_per_input(winners: &Winners) -> HashMap<usize, usize> {
    let mut counts = HashMap::new();
    for winner in winners.values() {
        *counts.entry(winner.input).or_insert(0) += 1;
    }
    counts
}

fn input_changed(input: &dyn Repackable, err: &rvs_store::StoreError) -> RepackError {
    warn!(input = %input.repack_id(), error = %err, "input unreadable on second pass; aborting");
    RepackError::InputChanged {
        input: input.repack_id(),
        reason: err.to_string(),
    }
}

/// Every winner selected from an input must be re-read from it.
fn check_written(input: &dyn Repackable, written: usize, expected: Option<&usize>) -> RepackResult<()> {
    let expected = expected.copied().unwrap_or(0);
    if written == expected {
        return Ok(());
    }
    warn!(
        input = %input.repack_id(),
        expected,
        written,
        "input yielded fewer entries on second pass; aborting"
    );
    Err(RepackError::InputChanged {
        input: input.repack_id(),
        reason: format!("{written} of {expected} selected entries could be re-read"),
    })
}

/// Unpublished output packs of one kind.
struct OutputSet {
    kind: PackKind,
    dir: PathBuf,
    max_size: u64,
    builders: Vec<PackBuilder>,
}

impl OutputSet {
    fn new(kind: PackKind, dir: &Path, max_size: u64) -> Self {
        Self {
            kind,
            dir: dir.to_path_buf(),
            max_size,
            builders: Vec::new(),
        }
    }

    fn append(&mut self, key: &ContentKey, record: &[u8]) -> RepackResult<()> {
        let full = self
            .builders
            .last()
            .map_or(true, |b| !b.is_empty() && b.body_len() >= self.max_size);
        if full {
            self.builders.push(PackBuilder::new(self.kind, &self.dir)?);
        }
        if let Some(builder) = self.builders.last_mut() {
            builder.append(key, record)?;
        }
        Ok(())
    }
}

/// Finish every builder. On failure, unlink whatever this call already
/// published, except files that also back an input.
fn publish(
    sets: impl IntoIterator<Item = OutputSet>,
    input_files: &HashSet<PathBuf>,
) -> RepackResult<Vec<PackPaths>> {
    let mut published = Vec::new();
    for builder in sets.into_iter().flat_map(|set| set.builders) {
        match builder.finish() {
            Ok(Some(paths)) => published.push(paths),
            Ok(None) => {}
            Err(e) => {
                for paths in &published {
                    for file in [&paths.body, &paths.index] {
                        if !input_files.contains(file) {
                            let _ = std::fs::remove_file(file);
                        }
                    }
                }
                warn!(error = %e, "publishing repack output failed; rolled back");
                return Err(e.into());
            }
        }
    }
    Ok(published)
}

fn paths_len(paths: &PackPaths) -> u64 {
    [&paths.body, &paths.index]
        .into_iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvs_pack::{DataPackStore, HistoryPackStore, MutableDataPack, MutableHistoryPack};
    use rvs_store::{InMemoryStore, MutableDataStore, MutableHistoryStore, StoreError};
    use rvs_types::{HistoryEntry, Node};

    fn key(name: &str) -> ContentKey {
        ContentKey::from_str_path(
            name,
            Node::hash_revision(&Node::null(), &Node::null(), name.as_bytes()),
        )
        .unwrap()
    }

    fn write_pack(dir: &Path, entries: &[(&ContentKey, &[u8])]) {
        let pack = MutableDataPack::new(dir).unwrap();
        for (k, text) in entries {
            pack.add(k, &DataEntry::full(text.to_vec())).unwrap();
        }
        pack.finalize().unwrap();
    }

    fn repacker(dir: &Path) -> Repacker {
        Repacker::new(dir.join("packs"), dir.join(REPACK_LOCK))
    }

    #[test]
    fn empty_input_list_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let report = repacker(dir.path()).run(&[]).unwrap();
        assert_eq!(report, RepackReport::default());
    }

    #[test]
    fn merges_packs_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let packs = dir.path().join("packs");
        let (a, b, c) = (key("a"), key("b"), key("c"));
        write_pack(&packs, &[(&a, b"one"), (&b, b"two")]);
        write_pack(&packs, &[(&b, b"two"), (&c, b"three")]);

        let store = DataPackStore::open(&packs).unwrap();
        assert_eq!(store.pack_count(), 2);
        let inputs = store.repack_inputs();
        let report = repacker(dir.path()).run(&inputs).unwrap();

        assert_eq!(report.inputs, 2);
        assert_eq!(report.inputs_removed, 2);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(report.entries_written, 3);
        assert_eq!(report.packs_written, 1);
        for path in inputs.iter().flat_map(|i| i.backing_files()) {
            assert!(!path.exists(), "{} still present", path.display());
        }

        store.rescan().unwrap();
        assert_eq!(store.pack_count(), 1);
        for (k, text) in [(&a, &b"one"[..]), (&b, b"two"), (&c, b"three")] {
            assert_eq!(store.get_entry(k).unwrap().unwrap().payload(), text);
        }
    }

    #[test]
    fn latest_input_wins_duplicates() {
        let older = Arc::new(InMemoryStore::named("older"));
        let newer = Arc::new(InMemoryStore::named("newer"));
        let k = key("k");
        older.add(&k, &DataEntry::full(b"old".to_vec())).unwrap();
        newer.add(&k, &DataEntry::full(b"new".to_vec())).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<Arc<dyn Repackable>> = vec![older.clone(), newer.clone()];
        let report = repacker(dir.path()).run(&inputs).unwrap();
        assert_eq!(report.duplicates_dropped, 1);
        assert!(older.is_empty() && newer.is_empty());

        let store = DataPackStore::open(&dir.path().join("packs")).unwrap();
        assert_eq!(store.get_entry(&k).unwrap().unwrap().payload(), b"new");
    }

    #[test]
    fn output_rolls_over_at_max_pack_size() {
        let dir = tempfile::tempdir().unwrap();
        let input = Arc::new(InMemoryStore::new());
        for i in 0..20 {
            let k = key(&format!("file{i}"));
            input.add(&k, &DataEntry::full(vec![i as u8; 100])).unwrap();
        }
        let report = repacker(dir.path())
            .with_options(RepackOptions {
                max_pack_size: 500,
                max_delta_chain: 0,
            })
            .run(&[input as Arc<dyn Repackable>])
            .unwrap();
        assert!(report.packs_written > 1);
        assert_eq!(report.entries_written, 20);

        let store = DataPackStore::open(&dir.path().join("packs")).unwrap();
        assert_eq!(store.pack_count(), report.packs_written);
        assert_eq!(store.entry_count(), 20);
    }

    #[test]
    fn history_is_repacked_alongside_data() {
        let dir = tempfile::tempdir().unwrap();
        let packs = dir.path().join("packs");
        let (parent, child) = (key("p"), key("c"));
        let entry = HistoryEntry::root(Node::null()).with_parents(Some(parent.clone()), None);
        for extra in [None, Some(&parent)] {
            let pack = MutableHistoryPack::new(&packs).unwrap();
            pack.add_history(&child, &entry).unwrap();
            if let Some(k) = extra {
                pack.add_history(k, &HistoryEntry::root(Node::null())).unwrap();
            }
            pack.finalize().unwrap();
        }
        let store = HistoryPackStore::open(&packs).unwrap();
        assert_eq!(store.pack_count(), 2);
        let report = repacker(dir.path()).run(&store.repack_inputs()).unwrap();
        assert_eq!(report.entries_written, 2);
        assert_eq!(report.duplicates_dropped, 1);
        store.rescan().unwrap();
        assert_eq!(store.pack_count(), 1);
        assert_eq!(store.get_history(&child).unwrap(), Some(entry));
    }

    #[test]
    fn lock_contention_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let packs = dir.path().join("packs");
        let k = key("k");
        write_pack(&packs, &[(&k, b"v")]);
        let store = DataPackStore::open(&packs).unwrap();
        let inputs = store.repack_inputs();

        let held = File::create(dir.path().join(REPACK_LOCK)).unwrap();
        held.lock_exclusive().unwrap();
        let err = repacker(dir.path()).run(&inputs).unwrap_err();
        assert!(matches!(err, RepackError::LockContention(_)));
        assert!(matches!(StoreError::from(err), StoreError::LockContention(_)));

        // Inputs untouched, no new files published.
        store.rescan().unwrap();
        assert_eq!(store.pack_count(), 1);
        assert!(inputs[0].backing_files().iter().all(|p| p.exists()));
        assert_eq!(store.get_entry(&k).unwrap().unwrap().payload(), b"v");
    }

    struct FlakyInput {
        good: ContentKey,
    }

    impl Repackable for FlakyInput {
        fn repack_id(&self) -> String {
            "flaky".into()
        }

        fn iter_data(&self) -> StoreResult<rvs_store::DataIter<'_>> {
            Ok(Box::new(
                vec![
                    Err(StoreError::corrupt("flaky", "crc mismatch")),
                    Ok((self.good.clone(), DataEntry::full(b"ok".to_vec()))),
                ]
                .into_iter(),
            ))
        }

        fn size_bytes(&self) -> u64 {
            0
        }

        fn remove(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[test]
    fn corrupt_entries_are_skipped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let good = key("good");
        let inputs: Vec<Arc<dyn Repackable>> = vec![Arc::new(FlakyInput { good: good.clone() })];
        let report = repacker(dir.path()).run(&inputs).unwrap();
        assert_eq!(report.corrupt_skipped, 1);
        assert_eq!(report.entries_written, 1);
        let store = DataPackStore::open(&dir.path().join("packs")).unwrap();
        assert_eq!(store.get_entry(&good).unwrap().unwrap().payload(), b"ok");
    }

    /// Yields its entry on the first read only.
    struct FadingInput {
        key: ContentKey,
        reads: std::sync::atomic::AtomicUsize,
        fail_whole_read: bool,
        removed: std::sync::atomic::AtomicBool,
    }

    impl FadingInput {
        fn new(key: ContentKey, fail_whole_read: bool) -> Self {
            Self {
                key,
                reads: Default::default(),
                fail_whole_read,
                removed: Default::default(),
            }
        }
    }

    impl Repackable for FadingInput {
        fn repack_id(&self) -> String {
            "fading".into()
        }

        fn iter_data(&self) -> StoreResult<rvs_store::DataIter<'_>> {
            use std::sync::atomic::Ordering;
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Box::new(std::iter::once(Ok((
                    self.key.clone(),
                    DataEntry::full(b"only copy".to_vec()),
                )))));
            }
            let err = StoreError::Io(std::io::Error::other("transient EIO"));
            if self.fail_whole_read {
                Err(err)
            } else {
                Ok(Box::new(std::iter::once(Err(err))))
            }
        }

        fn size_bytes(&self) -> u64 {
            0
        }

        fn remove(&self) -> StoreResult<()> {
            self.removed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn input_failing_on_second_read_aborts_the_pass() {
        for fail_whole_read in [true, false] {
            let dir = tempfile::tempdir().unwrap();
            let k = key("only");
            let older = Arc::new(InMemoryStore::named("older"));
            older.add(&k, &DataEntry::full(b"stale copy".to_vec())).unwrap();
            let fading = Arc::new(FadingInput::new(k.clone(), fail_whole_read));
            let inputs: Vec<Arc<dyn Repackable>> = vec![older.clone() as Arc<dyn Repackable>, fading.clone()];

            let err = repacker(dir.path()).run(&inputs).unwrap_err();
            assert!(matches!(err, RepackError::InputChanged { ref input, .. } if input == "fading"));
            assert!(StoreError::from(err).is_corrupt());

            // Nothing published and nothing unlinked.
            assert!(!fading.removed.load(std::sync::atomic::Ordering::SeqCst));
            assert!(older.contains(&k).unwrap());
            let store = DataPackStore::open(&dir.path().join("packs")).unwrap();
            assert_eq!(store.pack_count(), 0);
        }
    }

    #[test]
    fn repacking_a_single_pack_keeps_it() {
        let dir = tempfile::tempdir().unwrap();
        let packs = dir.path().join("packs");
        let k = key("k");
        write_pack(&packs, &[(&k, b"v")]);
        let store = DataPackStore::open(&packs).unwrap();

        repacker(dir.path()).run(&store.repack_inputs()).unwrap();
        store.rescan().unwrap();
        assert_eq!(store.get_entry(&k).unwrap().unwrap().payload(), b"v");
    }

    #[test]
    fn long_chains_are_rebased_onto_p1() {
        let source = Arc::new(InMemoryStore::named("source"));
        let mut text = b"line 0\n".to_vec();
        let root = key("f0");
        source.add(&root, &DataEntry::full(text.clone())).unwrap();
        source
            .add_history(&root, &HistoryEntry::root(Node::null()))
            .unwrap();

        let mut prev = root.clone();
        let mut keys = vec![root.clone()];
        let mut texts = vec![text.clone()];
        for i in 1..6 {
            let k = key(&format!("f{i}"));
            let next = [text.clone(), format!("line {i}\n").into_bytes()].concat();
            let patch = delta::diff(&text, &next);
            source
                .add(&k, &DataEntry::delta(prev.clone(), DeltaAlgorithm::Mpatch, patch))
                .unwrap();
            source
                .add_history(
                    &k,
                    &HistoryEntry::root(Node::null()).with_parents(Some(root.clone()), None),
                )
                .unwrap();
            text = next;
            prev = k.clone();
            keys.push(k);
            texts.push(text.clone());
        }

        let dir = tempfile::tempdir().unwrap();
        let report = repacker(dir.path())
            .with_options(RepackOptions {
                max_pack_size: 1 << 20,
                max_delta_chain: 2,
            })
            .with_resolver(source.clone(), source.clone())
            .run(&[source.clone() as Arc<dyn Repackable>])
            .unwrap();
        // f3, f4 and f5 sit more than two links from the root.
        assert_eq!(report.rebased, 3);

        let store = DataPackStore::open(&dir.path().join("packs")).unwrap();
        for (k, expected) in keys.iter().zip(&texts) {
            let entry = store.get_entry(k).unwrap().unwrap();
            assert!(delta::chain_depth(&store, k, &entry, 10).unwrap() <= 2);
            assert_eq!(&delta::resolve(&store, k, 32).unwrap().unwrap(), expected);
        }
        let last = store.get_entry(&keys[5]).unwrap().unwrap();
        assert_eq!(last.delta_base(), Some(&root));
    }

    #[test]
    fn sealed_log_segments_are_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let log = rvs_log::IndexedLogDataStore::open(
            &dir.path().join("log"),
            rvs_log::LogConfig::default(),
        )
        .unwrap();
        let (a, b) = (key("a"), key("b"));
        log.add(&a, &DataEntry::full(b"one".to_vec())).unwrap();
        log.add(&b, &DataEntry::full(b"two".to_vec())).unwrap();
        log.add(&a, &DataEntry::full(b"one".to_vec())).unwrap();
        log.log().seal().unwrap();

        let input: Arc<dyn Repackable> = Arc::new(log.repack_input().unwrap());
        let report = repacker(dir.path()).run(&[input]).unwrap();
        assert_eq!(report.entries_written, 2);
        assert_eq!(report.duplicates_dropped, 1);
        assert_eq!(report.inputs_removed, 1);
        assert!(log.log().is_empty());
        assert!(log.log().sealed_segments().is_empty());

        let store = DataPackStore::open(&dir.path().join("packs")).unwrap();
        assert_eq!(store.get_entry(&a).unwrap().unwrap().payload(), b"one");
        assert_eq!(store.get_entry(&b).unwrap().unwrap().payload(), b"two");
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn newest_copy_of_every_key_survives(
            inputs in proptest::collection::vec(
                proptest::collection::vec(
                    (0u8..16, proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)),
                    0..12,
                ),
                1..4,
            ),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut expected = HashMap::new();
            let mut stores: Vec<Arc<dyn Repackable>> = Vec::new();
            for (i, entries) in inputs.iter().enumerate() {
                let store = Arc::new(InMemoryStore::named(format!("input{i}")));
                for (name, text) in entries {
                    let k = key(&format!("f{name}"));
                    store.add(&k, &DataEntry::full(text.clone())).unwrap();
                    expected.insert(k, text.clone());
                }
                stores.push(store);
            }

            let report = repacker(dir.path()).run(&stores).unwrap();
            proptest::prop_assert_eq!(report.entries_written, expected.len());

            let packs = DataPackStore::open(&dir.path().join("packs")).unwrap();
            proptest::prop_assert_eq!(packs.entry_count(), expected.len());
            for (k, text) in &expected {
                let entry = packs.get_entry(k).unwrap().unwrap();
                proptest::prop_assert_eq!(entry.payload(), text.as_slice());
            }
        }
    }
}
