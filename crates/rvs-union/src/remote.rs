use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rvs_store::{DataStore, HistoryStore, StoreError, StoreResult};
use rvs_types::{ContentKey, DataEntry, HistoryEntry};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Answer to one batched remote request.
#[derive(Clone, Debug)]
pub struct FetchResult<V> {
    pub found: Vec<(ContentKey, V)>,
    pub missing: Vec<ContentKey>,
}

impl<V> Default for FetchResult<V> {
    fn default() -> Self {
        Self {
            found: Vec::new(),
            missing: Vec::new(),
        }
    }
}

/// The remote end of the fallback chain.
///
/// Requests are batched: the chain sends every key it could not answer
/// locally in one call. Retries and backoff belong to the implementation;
/// a retried request must answer exactly like a first attempt.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_data(&self, keys: &[ContentKey]) -> StoreResult<FetchResult<DataEntry>>;

    async fn fetch_history(&self, keys: &[ContentKey]) -> StoreResult<FetchResult<HistoryEntry>>;

    fn describe(&self) -> String {
        "remote".into()
    }
}

/// Runs [`RemoteStore`] requests from synchronous code.
///
/// Owns a single-threaded tokio runtime, so the chain never depends on an
/// ambient one. Every request is bounded by `timeout`. Must not be called
/// from inside an async context.
pub struct RemoteBridge {
    remote: Arc<dyn RemoteStore>,
    runtime: Runtime,
    timeout: Duration,
}

impl RemoteBridge {
    pub fn new(remote: Arc<dyn RemoteStore>, timeout: Duration) -> StoreResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            remote,
            runtime,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn describe(&self) -> String {
        self.remote.describe()
    }

    pub fn fetch_data(&self, keys: &[ContentKey]) -> StoreResult<FetchResult<DataEntry>> {
        self.run(keys.len(), self.remote.fetch_data(keys))
    }

    pub fn fetch_history(&self, keys: &[ContentKey]) -> StoreResult<FetchResult<HistoryEntry>> {
        self.run(keys.len(), self.remote.fetch_history(keys))
    }

    fn run<T>(
        &self,
        count: usize,
        request: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(StoreError::Transport(
                "remote fetch issued from inside an async runtime".into(),
            ));
        }
        debug!(keys = count, remote = %self.remote.describe(), "remote fetch");
        let outcome = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, request).await });
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(keys = count, timeout = ?self.timeout, "remote fetch timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

impl std::fmt::Debug for RemoteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBridge")
            .field("remote", &self.remote.describe())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A [`RemoteStore`] answered by local stores, e.g. another cache
/// directory or an in-memory fixture.
///
/// Can be switched offline and given artificial latency, and counts the
/// requests it receives.
pub struct StoreRemote {
    data: Arc<dyn DataStore>,
    history: Arc<dyn HistoryStore>,
    online: AtomicBool,
    latency: Option<Duration>,
    requests: AtomicUsize,
}

impl StoreRemote {
    pub fn new(data: Arc<dyn DataStore>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            data,
            history,
            online: AtomicBool::new(true),
            latency: None,
            requests: AtomicUsize::new(0),
        }
    }

    /// Delay every answer by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// While offline every request fails with a transport error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of batched requests received.
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> StoreResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("remote is offline".into()));
        }
        Ok(())
    }
}

fn collect<V>(
    keys: &[ContentKey],
    mut lookup: impl FnMut(&ContentKey) -> StoreResult<Option<V>>,
) -> FetchResult<V> {
    let mut result = FetchResult::default();
    for key in keys {
        match lookup(key) {
            Ok(Some(value)) => result.found.push((key.clone(), value)),
            Ok(None) => result.missing.push(key.clone()),
            Err(e) => {
                warn!(%key, error = %e, "remote could not read key");
                result.missing.push(key.clone());
            }
        }
    }
    result
}

#[async_trait]
impl RemoteStore for StoreRemote {
    async fn fetch_data(&self, keys: &[ContentKey]) -> StoreResult<FetchResult<DataEntry>> {
        self.begin().await?;
        Ok(collect(keys, |key| self.data.get_entry(key)))
    }

    async fn fetch_history(&self, keys: &[ContentKey]) -> StoreResult<FetchResult<HistoryEntry>> {
        self.begin().await?;
        Ok(collect(keys, |key| self.history.get_history(key)))
    }

    fn describe(&self) -> String {
        format!("remote({})", self.data.describe())
    }
}
