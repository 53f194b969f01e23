//! Compute-on-miss with per-key request coalescing
//!
//! Concurrent misses on one key share a single loader run. The first caller
//! registers a watch channel in the in-flight map and runs the loader; later
//! callers subscribe to that channel and receive the same outcome.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::holder::is_valid_ttl;
use crate::tier::{CacheKey, Cacheable};
use crate::{CacheError, CacheResultCode, LoaderError, MultiLevelCache};

/// Outcome of one loader run, as seen by every caller coalesced onto it
#[derive(Clone)]
pub(crate) enum LoadOutcome<V> {
    Loaded(Option<V>),
    Failed(Arc<dyn Error + Send + Sync>),
}

impl<V> LoadOutcome<V> {
    fn into_result(self) -> Result<Option<V>, CacheError> {
        match self {
            LoadOutcome::Loaded(value) => Ok(value),
            LoadOutcome::Failed(error) => Err(CacheError::Loader(error)),
        }
    }
}

type LoadSignal<V> = watch::Receiver<Option<LoadOutcome<V>>>;

/// Keys with a load in progress
pub(crate) type InFlightMap<K, V> = DashMap<K, LoadSignal<V>>;

/// Per-call overrides for `compute_if_absent_with`
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    /// Store a loader's `None` as a cached null.
    pub cache_null_value: Option<bool>,
    pub ttl: Option<Duration>,
    /// Bound on waiting for another caller's load.
    pub wait_timeout: Option<Duration>,
}

impl ComputeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_null_value(mut self, enabled: bool) -> Self {
        self.cache_null_value = Some(enabled);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }
}

/// Held by the caller running the loader. Dropping it unregisters the load
/// and wakes any waiter that has not yet been sent an outcome.
struct InFlightGuard<'a, K: CacheKey, V: Cacheable> {
    map: &'a InFlightMap<K, V>,
    key: K,
    sender: watch::Sender<Option<LoadOutcome<V>>>,
}

impl<K: CacheKey, V: Cacheable> InFlightGuard<'_, K, V> {
    fn complete(self, outcome: LoadOutcome<V>) {
        self.sender.send_replace(Some(outcome));
    }
}

impl<K: CacheKey, V: Cacheable> Drop for InFlightGuard<'_, K, V> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

enum Role<'a, K: CacheKey, V: Cacheable> {
    Leader(InFlightGuard<'a, K, V>),
    Waiter(LoadSignal<V>),
}

impl<K: CacheKey, V: Cacheable> MultiLevelCache<K, V> {
    /// Return the cached value for `key`, or run `loader` once across all
    /// concurrent callers and cache what it returns.
    ///
    /// A cached null is a hit and returns `Ok(None)` without loading. Whether
    /// a loaded `None` is stored follows [`CacheConfig::cache_null_value`](crate::CacheConfig).
    pub async fn compute_if_absent<F, Fut>(&self, key: &K, loader: F) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>, LoaderError>> + Send,
    {
        self.compute_if_absent_with(key, loader, ComputeOptions::default())
            .await
    }

    pub async fn compute_if_absent_with<F, Fut>(
        &self,
        key: &K,
        loader: F,
        options: ComputeOptions,
    ) -> Result<Option<V>, CacheError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<V>, LoaderError>> + Send,
    {
        let config = &self.inner.config;
        let ttl = options.ttl.unwrap_or(config.default_ttl);
        if !is_valid_ttl(ttl) {
            return Err(CacheError::InvalidTtl);
        }
        let cache_null = options.cache_null_value.unwrap_or(config.cache_null_value);
        let wait_timeout = options.wait_timeout.or(config.load_wait_timeout);

        let cached = self.get(key).await;
        match cached.code() {
            CacheResultCode::Success => return Ok(cached.into_value()),
            CacheResultCode::Fail => {
                warn!("{}: read of key {} failed, loading instead", config.name, key);
            }
            _ => {}
        }

        let guard = match self.join_or_lead(key) {
            Role::Waiter(signal) => {
                debug!("{}: waiting on in-flight load of key {}", config.name, key);
                return Self::wait_for(signal, wait_timeout).await;
            }
            Role::Leader(guard) => guard,
        };

        // A previous leader may have stored the value after our first read.
        let cached = self.get(key).await;
        if cached.is_success() {
            let value = cached.into_value();
            guard.complete(LoadOutcome::Loaded(value.clone()));
            return Ok(value);
        }

        match loader().await {
            Ok(value) => {
                if value.is_some() || cache_null {
                    let stored = self.put_with_ttl(key, value.clone(), ttl).await;
                    if !stored.is_success() {
                        warn!(
                            "{}: loaded key {} but caching it returned {:?}",
                            config.name,
                            key,
                            stored.code()
                        );
                    }
                }
                guard.complete(LoadOutcome::Loaded(value.clone()));
                Ok(value)
            }
            Err(error) => {
                let shared: Arc<dyn Error + Send + Sync> = Arc::from(error);
                warn!("{}: loader for key {} failed: {}", config.name, key, shared);
                guard.complete(LoadOutcome::Failed(Arc::clone(&shared)));
                Err(CacheError::Loader(shared))
            }
        }
    }

    fn join_or_lead(&self, key: &K) -> Role<'_, K, V> {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Waiter(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(receiver);
                Role::Leader(InFlightGuard {
                    map: &self.inner.in_flight,
                    key: key.clone(),
                    sender,
                })
            }
        }
    }

    async fn wait_for(
        mut signal: LoadSignal<V>,
        timeout: Option<Duration>,
    ) -> Result<Option<V>, CacheError> {
        let wait = async move {
            loop {
                let current = signal.borrow_and_update().clone();
                if let Some(outcome) = current {
                    return outcome.into_result();
                }
                if signal.changed().await.is_err() {
                    let last = signal.borrow().clone();
                    return match last {
                        Some(outcome) => outcome.into_result(),
                        None => Err(CacheError::LoadAborted),
                    };
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| CacheError::WaitTimeout(limit))?,
            None => wait.await,
        }
    }
}
