use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rvs_store::delta;
use rvs_store::{
    DataStore, HistoryStore, MutableDataStore, MutableHistoryStore, StoreError, StoreResult,
};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};
use tracing::{debug, warn};

use crate::remote::{FetchResult, RemoteBridge};
use crate::types::{BatchResult, FailureKind, StoreFailure, StoreTier, UnionOptions};

/// A value a fallback chain can look up: revision content or history.
///
/// Ties each value type to the store traits that produce and accept it,
/// so one chain implementation serves both.
pub trait ChainValue: Clone + Send + Sync + 'static {
    type Store: ?Sized + Send + Sync;
    type Sink: ?Sized + Send + Sync;

    fn lookup(store: &Self::Store, key: &ContentKey) -> StoreResult<Option<Self>>;

    fn describe(store: &Self::Store) -> String;

    fn write(sink: &Self::Sink, key: &ContentKey, value: &Self) -> StoreResult<()>;

    fn fetch(remote: &RemoteBridge, keys: &[ContentKey]) -> StoreResult<FetchResult<Self>>;
}

impl ChainValue for DataEntry {
    type Store = dyn DataStore;
    type Sink = dyn MutableDataStore;

    fn lookup(store: &Self::Store, key: &ContentKey) -> StoreResult<Option<Self>> {
        store.get_entry(key)
    }

    fn describe(store: &Self::Store) -> String {
        store.describe()
    }

    fn write(sink: &Self::Sink, key: &ContentKey, value: &Self) -> StoreResult<()> {
        sink.add(key, value)
    }

    fn fetch(remote: &RemoteBridge, keys: &[ContentKey]) -> StoreResult<FetchResult<Self>> {
        remote.fetch_data(keys)
    }
}

impl ChainValue for HistoryEntry {
    type Store = dyn HistoryStore;
    type Sink = dyn MutableHistoryStore;

    fn lookup(store: &Self::Store, key: &ContentKey) -> StoreResult<Option<Self>> {
        store.get_history(key)
    }

    fn describe(store: &Self::Store) -> String {
        store.describe()
    }

    fn write(sink: &Self::Sink, key: &ContentKey, value: &Self) -> StoreResult<()> {
        sink.add_history(key, value)
    }

    fn fetch(remote: &RemoteBridge, keys: &[ContentKey]) -> StoreResult<FetchResult<Self>> {
        remote.fetch_history(keys)
    }
}

struct Member<V: ChainValue> {
    tier: StoreTier,
    store: Arc<V::Store>,
}

/// An ordered fallback chain of stores, optionally backed by a remote.
///
/// Members are queried in the order they were added; the first one that
/// answers wins. Hits from [`StoreTier::Shared`] members and from the
/// remote are copied into the write-back sink, so a later lookup succeeds
/// without them. A member that errors is skipped for that key and the
/// error is recorded, never returned as content.
pub struct UnionStore<V: ChainValue> {
    members: Vec<Member<V>>,
    write_back: Option<Arc<V::Sink>>,
    remote: Option<Arc<RemoteBridge>>,
    options: UnionOptions,
}

pub type UnionDataStore = UnionStore<DataEntry>;
pub type UnionHistoryStore = UnionStore<HistoryEntry>;

impl<V: ChainValue> Default for UnionStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: ChainValue> UnionStore<V> {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
            write_back: None,
            remote: None,
            options: UnionOptions::default(),
        }
    }

    /// Append a member after every existing one.
    pub fn with_member(mut self, tier: StoreTier, store: Arc<V::Store>) -> Self {
        self.members.push(Member { tier, store });
        self
    }

    pub fn with_write_back(mut self, sink: Arc<V::Sink>) -> Self {
        self.write_back = Some(sink);
        self
    }

    pub fn with_remote(mut self, remote: Arc<RemoteBridge>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_options(mut self, options: UnionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &UnionOptions {
        &self.options
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Names of the members in lookup order, then the remote.
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .iter()
            .map(|m| V::describe(&m.store))
            .collect();
        if let Some(remote) = &self.remote {
            names.push(remote.describe());
        }
        names
    }

    /// Look up a batch of keys.
    ///
    /// Duplicate keys are answered once. Keys no local member answers are
    /// sent to the remote in a single request; if that request fails they
    /// are reported missing and the failure is recorded.
    pub fn get_batch(&self, keys: &[ContentKey]) -> BatchResult<V> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut pending: Vec<ContentKey> = keys
            .iter()
            .filter(|k| seen.insert(*k))
            .cloned()
            .collect();
        let mut result = BatchResult::default();

        for member in &self.members {
            if pending.is_empty() {
                break;
            }
            let mut unanswered = Vec::with_capacity(pending.len());
            for key in pending {
                match V::lookup(&member.store, &key) {
                    Ok(Some(value)) => {
                        if member.tier == StoreTier::Shared {
                            self.write_back(&key, &value);
                        }
                        result.found.insert(key, value);
                    }
                    Ok(None) => unanswered.push(key),
                    Err(e) => {
                        let store = V::describe(&member.store);
                        warn!(%key, %store, error = %e, "store failed, trying next");
                        result
                            .failures
                            .push(StoreFailure::new(store, Some(key.clone()), &e));
                        unanswered.push(key);
                    }
                }
            }
            pending = unanswered;
        }

        if !pending.is_empty() {
            if let Some(remote) = &self.remote {
                self.fetch_remote(remote, &pending, &mut result);
            }
        }

        let missing: Vec<ContentKey> = pending
            .into_iter()
            .filter(|k| !result.found.contains_key(k))
            .collect();
        result.missing = missing;
        result
    }

    fn fetch_remote(&self, remote: &RemoteBridge, pending: &[ContentKey], result: &mut BatchResult<V>) {
        match V::fetch(remote, pending) {
            Ok(fetched) => {
                let wanted: HashSet<&ContentKey> = pending.iter().collect();
                let mut accepted = 0usize;
                for (key, value) in fetched.found {
                    if !wanted.contains(&key) {
                        debug!(%key, "remote returned an unrequested key");
                        continue;
                    }
                    self.write_back(&key, &value);
                    result.found.insert(key, value);
                    accepted += 1;
                }
                debug!(
                    requested = pending.len(),
                    found = accepted,
                    "remote fetch complete"
                );
            }
            Err(e) => {
                warn!(keys = pending.len(), error = %e, "remote fetch failed");
                result
                    .failures
                    .push(StoreFailure::new(remote.describe(), None, &e));
            }
        }
    }

    fn write_back(&self, key: &ContentKey, value: &V) {
        if let Some(sink) = &self.write_back {
            if let Err(e) = V::write(sink, key, value) {
                warn!(%key, error = %e, "write-back failed");
            }
        }
    }

    /// Look up one key.
    ///
    /// `Ok(None)` when nothing answered and nothing failed. When nothing
    /// answered but a store was corrupt or the remote failed, that failure
    /// is returned instead.
    pub fn get_single(&self, key: &ContentKey) -> StoreResult<Option<V>> {
        let mut batch = self.get_batch(std::slice::from_ref(key));
        if let Some(value) = batch.found.remove(key) {
            return Ok(Some(value));
        }
        let failure = batch
            .failures
            .iter()
            .find(|f| f.kind == FailureKind::Corrupt)
            .or_else(|| batch.failures.iter().find(|f| f.kind == FailureKind::Transport));
        match failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(None),
        }
    }

    /// Like [`get_single`](Self::get_single), but absence is an error.
    pub fn require(&self, key: &ContentKey) -> StoreResult<V> {
        self.get_single(key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }
}

impl UnionStore<DataEntry> {
    /// Full text of `key`, resolving delta bases through this same chain.
    pub fn get_full(&self, key: &ContentKey) -> StoreResult<Option<Vec<u8>>> {
        delta::resolve(self, key, self.options.max_delta_depth)
    }

    /// Full text of every key in the batch.
    ///
    /// Delta bases are fetched a chain level at a time, so a batch costs
    /// at most one remote request per level rather than one per key. An
    /// entry whose delta chain cannot be resolved is reported missing
    /// with a corruption failure; it never appears in `found`.
    pub fn get_full_batch(&self, keys: &[ContentKey]) -> BatchResult<Vec<u8>> {
        let raw = self.get_batch(keys);
        let mut result = BatchResult {
            found: Default::default(),
            missing: raw.missing,
            failures: raw.failures,
        };
        let mut entries: Vec<(ContentKey, DataEntry)> = raw.found.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut bases = FetchedBases::default();
        bases.insert_all(entries.iter().map(|(k, e)| (k.clone(), e.clone())));
        let mut frontier = bases.unfetched(entries.iter().map(|(_, e)| e));
        let mut level = 0;
        while !frontier.is_empty() && level < self.options.max_delta_depth {
            level += 1;
            let batch = self.get_batch(&frontier);
            debug!(level, bases = frontier.len(), found = batch.found.len(), "fetched delta bases");
            bases.record_failures(&batch);
            let found: Vec<DataEntry> = batch.found.values().cloned().collect();
            bases.insert_all(batch.found);
            frontier = bases.unfetched(found.iter());
        }

        for (key, entry) in entries {
            match delta::resolve_entry(&bases, &key, entry, self.options.max_delta_depth) {
                Ok(text) => {
                    result.found.insert(key, text);
                }
                Err(e) => {
                    warn!(%key, error = %e, "cannot materialize entry");
                    result
                        .failures
                        .push(StoreFailure::new("delta", Some(key.clone()), &e));
                    result.missing.push(key);
                }
            }
        }
        result
    }
}

/// Entries gathered while resolving a batch, and why any base is absent.
#[derive(Default)]
struct FetchedBases {
    entries: HashMap<ContentKey, DataEntry>,
    attempted: HashSet<ContentKey>,
    failures: HashMap<ContentKey, StoreFailure>,
}

impl FetchedBases {
    fn insert_all(&mut self, found: impl IntoIterator<Item = (ContentKey, DataEntry)>) {
        for (key, entry) in found {
            self.attempted.insert(key.clone());
            self.entries.insert(key, entry);
        }
    }

    /// Delta bases of `entries` not yet looked up.
    fn unfetched<'a>(&mut self, entries: impl Iterator<Item = &'a DataEntry>) -> Vec<ContentKey> {
        let mut next = Vec::new();
        for base in entries.filter_map(DataEntry::delta_base) {
            if self.attempted.insert(base.clone()) {
                next.push(base.clone());
            }
        }
        next
    }

    /// Keep the failure that explains each missing base, corruption first,
    /// then a failed remote request.
    fn record_failures(&mut self, batch: &BatchResult<DataEntry>) {
        for key in &batch.missing {
            let failure = batch
                .failures_for(key)
                .find(|f| f.kind == FailureKind::Corrupt)
                .or_else(|| {
                    batch
                        .failures
                        .iter()
                        .find(|f| f.key.is_none() && f.kind == FailureKind::Transport)
                });
            if let Some(failure) = failure {
                self.failures.insert(key.clone(), failure.clone());
            }
        }
    }
}

impl DataStore for FetchedBases {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(Some(entry.clone()));
        }
        match self.failures.get(key) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(None),
        }
    }

    fn describe(&self) -> String {
        "fetched delta bases".into()
    }
}

impl DataStore for UnionStore<DataEntry> {
    fn get_entry(&self, key: &ContentKey) -> StoreResult<Option<DataEntry>> {
        self.get_single(key)
    }

    fn get_missing(&self, keys: &[ContentKey]) -> StoreResult<Vec<ContentKey>> {
        Ok(self.get_batch(keys).missing)
    }

    fn describe(&self) -> String {
        format!("union [{}]", self.member_names().join(", "))
    }
}

impl HistoryStore for UnionStore<HistoryEntry> {
    fn get_history(&self, key: &ContentKey) -> StoreResult<Option<HistoryEntry>> {
        self.get_single(key)
    }

    fn describe(&self) -> String {
        format!("union [{}]", self.member_names().join(", "))
    }
}

impl<V: ChainValue> std::fmt::Debug for UnionStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnionStore")
            .field("members", &self.member_names())
            .field("write_back", &self.write_back.is_some())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::StoreRemote;
    use rvs_store::InMemoryStore;
    use rvs_types::{DeltaAlgorithm, Node};
    use std::time::Duration;

    fn key(name: &str) -> ContentKey {
        ContentKey::from_str_path(
            name,
            Node::hash_revision(&Node::null(), &Node::null(), name.as_bytes()),
        )
        .unwrap()
    }

    fn text(k: &ContentKey) -> DataEntry {
        DataEntry::full(k.path.as_bytes().to_vec())
    }

    struct BrokenStore;

    impl DataStore for BrokenStore {
        fn get_entry(&self, _key: &ContentKey) -> StoreResult<Option<DataEntry>> {
            Err(StoreError::corrupt("broken", "index checksum mismatch"))
        }

        fn describe(&self) -> String {
            "broken".into()
        }
    }

    struct Fixture {
        local: Arc<InMemoryStore>,
        shared: Arc<InMemoryStore>,
        upstream: Arc<InMemoryStore>,
        remote: Arc<StoreRemote>,
        chain: UnionDataStore,
    }

    fn fixture() -> Fixture {
        let local = Arc::new(InMemoryStore::named("local"));
        let shared = Arc::new(InMemoryStore::named("shared"));
        let upstream = Arc::new(InMemoryStore::named("upstream"));
        let remote = Arc::new(StoreRemote::new(upstream.clone(), upstream.clone()));
        let bridge = RemoteBridge::new(remote.clone(), Duration::from_secs(5)).unwrap();
        let chain = UnionDataStore::new()
            .with_member(StoreTier::Local, local.clone())
            .with_member(StoreTier::Shared, shared.clone())
            .with_write_back(local.clone())
            .with_remote(Arc::new(bridge));
        Fixture {
            local,
            shared,
            upstream,
            remote,
            chain,
        }
    }

    #[test]
    fn batch_spans_local_shared_and_remote() {
        let f = fixture();
        let (a, b, c, d) = (key("a"), key("b"), key("c"), key("d"));
        f.local.add(&a, &text(&a)).unwrap();
        f.shared.add(&b, &text(&b)).unwrap();
        f.upstream.add(&c, &text(&c)).unwrap();

        let batch = f.chain.get_batch(&[a.clone(), b.clone(), c.clone(), d.clone(), a.clone()]);
        assert_eq!(batch.found.len(), 3);
        assert_eq!(batch.missing, vec![d]);
        assert!(batch.failures.is_empty());
        assert_eq!(f.remote.request_count(), 1);

        // Shared and remote hits were copied into the local store.
        assert!(f.local.contains(&b).unwrap());
        assert!(f.local.contains(&c).unwrap());
    }

    #[test]
    fn remote_hit_survives_remote_going_offline() {
        let f = fixture();
        let k = key("only-remote");
        f.upstream.add(&k, &text(&k)).unwrap();

        assert_eq!(f.chain.get_single(&k).unwrap(), Some(text(&k)));
        f.remote.set_online(false);
        assert_eq!(f.chain.get_single(&k).unwrap(), Some(text(&k)));
        assert_eq!(f.remote.request_count(), 1);
    }

    #[test]
    fn first_member_wins() {
        let f = fixture();
        let k = key("k");
        f.local.add(&k, &DataEntry::full(b"local".to_vec())).unwrap();
        f.shared.add(&k, &DataEntry::full(b"shared".to_vec())).unwrap();
        assert_eq!(f.chain.get_single(&k).unwrap().unwrap().payload(), b"local");
    }

    #[test]
    fn transport_failure_reports_missing_with_flag() {
        let f = fixture();
        let (a, b) = (key("a"), key("b"));
        f.local.add(&a, &text(&a)).unwrap();
        f.remote.set_online(false);

        let batch = f.chain.get_batch(&[a.clone(), b.clone()]);
        assert!(batch.found.contains_key(&a));
        assert_eq!(batch.missing, vec![b.clone()]);
        assert!(batch.transport_failed());
        assert!(!batch.has_corruption());

        assert!(f.chain.get_single(&b).unwrap_err().is_transport());
    }

    #[test]
    fn corrupt_member_is_skipped() {
        let fallback = Arc::new(InMemoryStore::named("fallback"));
        let k = key("k");
        fallback.add(&k, &text(&k)).unwrap();
        let chain = UnionDataStore::new()
            .with_member(StoreTier::Local, Arc::new(BrokenStore))
            .with_member(StoreTier::Local, fallback);

        let batch = chain.get_batch(&[k.clone(), key("gone")]);
        assert_eq!(batch.found.get(&k), Some(&text(&k)));
        assert_eq!(batch.missing, vec![key("gone")]);
        assert!(batch.has_corruption());
        assert_eq!(batch.failures_for(&k).count(), 1);

        // Found despite the broken member.
        assert!(chain.get_single(&k).unwrap().is_some());
        // Nothing answered and a member was corrupt: surfaced as corruption.
        assert!(chain.get_single(&key("gone")).unwrap_err().is_corrupt());
    }

    #[test]
    fn missing_without_failures_is_none() {
        let chain = UnionDataStore::new()
            .with_member(StoreTier::Local, Arc::new(InMemoryStore::new()));
        assert_eq!(chain.get_single(&key("nope")).unwrap(), None);
        assert!(matches!(
            chain.require(&key("nope")).unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn delta_base_resolved_through_chain() {
        let f = fixture();
        let base = key("base");
        let child = key("child");
        f.upstream
            .add(&base, &DataEntry::full(b"hello world".to_vec()))
            .unwrap();
        let patch = delta::diff(b"hello world", b"hello there world");
        f.local
            .add(&child, &DataEntry::delta(base.clone(), DeltaAlgorithm::Mpatch, patch))
            .unwrap();

        assert_eq!(
            f.chain.get_full(&child).unwrap().unwrap(),
            b"hello there world".to_vec()
        );
        let batch = f.chain.get_full_batch(&[child.clone(), base.clone()]);
        assert_eq!(batch.found.len(), 2);
        assert_eq!(batch.found[&base], b"hello world".to_vec());
    }

    #[test]
    fn delta_bases_are_fetched_per_level_not_per_key() {
        let f = fixture();
        let mut wanted = Vec::new();
        for i in 0..5 {
            let (root, mid, tip) = (key(&format!("r{i}")), key(&format!("m{i}")), key(&format!("t{i}")));
            f.upstream.add(&root, &DataEntry::full(b"a\n".to_vec())).unwrap();
            f.upstream
                .add(&mid, &DataEntry::delta(root, DeltaAlgorithm::Mpatch, delta::diff(b"a\n", b"a\nb\n")))
                .unwrap();
            f.upstream
                .add(
                    &tip,
                    &DataEntry::delta(mid, DeltaAlgorithm::Mpatch, delta::diff(b"a\nb\n", b"a\nb\nc\n")),
                )
                .unwrap();
            wanted.push(tip);
        }

        let batch = f.chain.get_full_batch(&wanted);
        assert_eq!(batch.found.len(), 5);
        assert!(batch.failures.is_empty());
        assert!(batch.found.values().all(|text| text == b"a\nb\nc\n"));
        // The tips, then each level of bases.
        assert_eq!(f.remote.request_count(), 3);
    }

    #[test]
    fn unresolvable_delta_is_missing_and_corrupt() {
        let f = fixture();
        let child = key("child");
        f.local
            .add(
                &child,
                &DataEntry::delta(key("nowhere"), DeltaAlgorithm::Mpatch, Vec::new()),
            )
            .unwrap();
        let batch = f.chain.get_full_batch(&[child.clone()]);
        assert!(batch.found.is_empty());
        assert_eq!(batch.missing, vec![child.clone()]);
        assert!(batch.has_corruption());
        assert!(f.chain.get_full(&child).unwrap_err().is_corrupt());
    }

    #[test]
    fn history_chain() {
        let local = Arc::new(InMemoryStore::new());
        let shared = Arc::new(InMemoryStore::new());
        let k = key("h");
        let entry = HistoryEntry::root(Node::null()).with_parents(Some(key("p")), None);
        shared.add_history(&k, &entry).unwrap();

        let chain = UnionHistoryStore::new()
            .with_member(StoreTier::Local, local.clone())
            .with_member(StoreTier::Shared, shared)
            .with_write_back(local.clone());
        assert_eq!(chain.get_history(&k).unwrap(), Some(entry.clone()));
        assert_eq!(local.get_history(&k).unwrap(), Some(entry));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]

        #[test]
        fn batch_partitions_requested_keys(
            placement in proptest::collection::vec(0u8..4, 1..24),
            requested in proptest::collection::vec(0usize..32, 0..40),
        ) {
            // 0: local, 1: shared, 2: remote, 3: nowhere.
            let f = fixture();
            let keys: Vec<ContentKey> = (0..32).map(|i| key(&format!("k{i}"))).collect();
            for (i, place) in placement.iter().enumerate() {
                let k = &keys[i];
                match place {
                    0 => f.local.add(k, &text(k)).unwrap(),
                    1 => f.shared.add(k, &text(k)).unwrap(),
                    2 => f.upstream.add(k, &text(k)).unwrap(),
                    _ => {}
                }
            }

            let wanted: Vec<ContentKey> = requested.iter().map(|&i| keys[i].clone()).collect();
            let batch = f.chain.get_batch(&wanted);
            let unique: HashSet<&ContentKey> = wanted.iter().collect();

            proptest::prop_assert_eq!(batch.found.len() + batch.missing.len(), unique.len());
            for k in &batch.missing {
                proptest::prop_assert!(!batch.found.contains_key(k));
                proptest::prop_assert!(unique.contains(k));
            }
            for (k, v) in &batch.found {
                proptest::prop_assert!(unique.contains(k));
                proptest::prop_assert_eq!(v, &text(k));
            }
            proptest::prop_assert!(f.remote.request_count() <= 1);
            proptest::prop_assert!(batch.failures.is_empty());
        }
    }
}
