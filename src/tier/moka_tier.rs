//! In-process tier backed by Moka
//!
//! Entries are shared envelopes. A moka [`Expiry`] evicts each entry when its
//! envelope expires, and reads check the envelope as well so an entry is never
//! served past its expiry even before eviction catches up.

use std::collections::HashMap;
use std::future::ready;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use tracing::debug;

use super::{AtomicTier, CacheKey, CacheTier, Cacheable, HolderResult};
use crate::{
    CacheGetResult, CacheResult, CacheValueHolder, ExpirePolicy, MokaTierConfig, MultiGetResult,
    now_millis,
};

/// Evicts an entry once its envelope's expiry time has passed.
struct HolderExpiry;

impl HolderExpiry {
    fn time_left<V>(holder: &CacheValueHolder<V>) -> Option<Duration> {
        Some(holder.remaining(now_millis()).unwrap_or(Duration::ZERO))
    }
}

impl<K, V> Expiry<K, Arc<CacheValueHolder<V>>> for HolderExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &Arc<CacheValueHolder<V>>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Self::time_left(value)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &Arc<CacheValueHolder<V>>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Self::time_left(value)
    }
}

/// Local, per-process tier.
pub struct MokaTier<K: CacheKey, V: Cacheable> {
    name: String,
    cache: Cache<K, Arc<CacheValueHolder<V>>>,
    expire_policy: ExpirePolicy,
}

impl<K: CacheKey, V: Cacheable> MokaTier<K, V> {
    pub fn new(name: impl Into<String>, config: MokaTierConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(HolderExpiry)
            .build();

        Self {
            name: name.into(),
            cache,
            expire_policy: config.expire_policy,
        }
    }

    /// Re-insert the refreshed envelope unless the entry was replaced since
    /// `seen` was read.
    async fn touch(&self, key: &K, seen: Arc<CacheValueHolder<V>>, refreshed: CacheValueHolder<V>) {
        let _ = self
            .cache
            .entry(key.clone())
            .and_compute_with(move |current| {
                let op = match current {
                    Some(entry) if Arc::ptr_eq(entry.value(), &seen) => {
                        Op::Put(Arc::new(refreshed))
                    }
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;
    }
}

#[async_trait::async_trait]
impl<K: CacheKey, V: Cacheable> CacheTier<K, V> for MokaTier<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> HolderResult<V> {
        let Some(entry) = self.cache.get(key).await else {
            return CacheGetResult::not_exists();
        };

        let now = now_millis();
        if entry.is_expired(now) {
            debug!("{}: entry for key {} has expired", self.name, key);
            return CacheGetResult::expired();
        }

        match self.expire_policy {
            ExpirePolicy::AfterWrite => CacheGetResult::hit(Some(entry.as_ref().clone())),
            ExpirePolicy::AfterAccess => {
                let refreshed = entry.refreshed(now);
                self.touch(key, entry, refreshed.clone()).await;
                CacheGetResult::hit(Some(refreshed))
            }
        }
    }

    async fn get_all(&self, keys: &[K]) -> MultiGetResult<K, CacheValueHolder<V>> {
        let mut values = HashMap::with_capacity(keys.len());
        for key in keys {
            let result = self.get(key).await;
            values.insert(key.clone(), result);
        }
        MultiGetResult::from_values(values)
    }

    async fn put(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult {
        self.cache.insert(key.clone(), Arc::new(holder)).await;
        CacheResult::success()
    }

    async fn put_all(&self, entries: Vec<(K, CacheValueHolder<V>)>) -> CacheResult {
        for (key, holder) in entries {
            self.cache.insert(key, Arc::new(holder)).await;
        }
        CacheResult::success()
    }

    async fn remove(&self, key: &K) -> CacheResult {
        match self.cache.remove(key).await {
            Some(_) => CacheResult::success(),
            None => CacheResult::not_exists(),
        }
    }

    async fn remove_all(&self, keys: &[K]) -> CacheResult {
        for key in keys {
            self.cache.invalidate(key).await;
        }
        CacheResult::success()
    }
}

#[async_trait::async_trait]
impl<K, V> AtomicTier<K, V> for MokaTier<K, V>
where
    K: CacheKey,
    V: Cacheable + PartialEq,
{
    async fn put_if_absent(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult {
        let now = now_millis();
        let result = self
            .cache
            .entry(key.clone())
            .and_compute_with(move |current| {
                let op = match current {
                    Some(entry) if !entry.value().is_expired(now) => Op::Nop,
                    _ => Op::Put(Arc::new(holder)),
                };
                ready(op)
            })
            .await;

        match result {
            CompResult::Inserted(_) | CompResult::ReplacedWith(_) => CacheResult::success(),
            _ => CacheResult::exists(),
        }
    }

    async fn remove_if_matches(&self, key: &K, expected: &CacheValueHolder<V>) -> CacheResult {
        let result = self
            .cache
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(entry) if entry.value().same_write(expected) => Op::Remove,
                    _ => Op::Nop,
                };
                ready(op)
            })
            .await;

        match result {
            CompResult::Removed(_) => CacheResult::success(),
            _ => CacheResult::not_exists(),
        }
    }
}
