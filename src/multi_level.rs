//! Multi-level cache engine
//!
//! Composes an ordered list of tiers, tier 0 the fastest and the last one
//! authoritative:
//! - Reads try tiers in order and promote a hit into the tiers above it
//! - Writes go through to every tier, fastest first
//! - Removals cascade to every tier
//! - Conditional inserts and locks use the authoritative tier's atomic
//!   insert-if-absent

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::holder::is_valid_ttl;
use crate::invalidation::RemoteInvalidation;
use crate::lock::LockManager;
use crate::single_flight::InFlightMap;
use crate::tier::{AtomicTier, CacheKey, Cacheable, HolderResult, Tier};
use crate::{
    CacheConfig, CacheError, CacheGetResult, CacheResult, CacheResultCode, CacheValueHolder,
    LockGuard, MultiGetResult, now_millis,
};

/// Handle to a multi-level cache. Clones share the same tiers and state.
pub struct MultiLevelCache<K: CacheKey, V: Cacheable> {
    pub(crate) inner: Arc<MultiLevelCacheInner<K, V>>,
}

pub(crate) struct MultiLevelCacheInner<K: CacheKey, V: Cacheable> {
    pub(crate) tiers: Vec<Tier<K, V>>,
    pub(crate) config: CacheConfig,
    /// In-flight compute-on-miss loads for request coalescing
    pub(crate) in_flight: InFlightMap<K, V>,
    pub(crate) locks: Option<LockManager>,
    pub(crate) invalidation: Option<Arc<RemoteInvalidation<K>>>,
}

impl<K: CacheKey, V: Cacheable> Clone for MultiLevelCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: Cacheable> fmt::Debug for MultiLevelCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("name", &self.inner.config.name)
            .field("tiers", &self.tier_names())
            .finish()
    }
}

/// Builder for [`MultiLevelCache`]; tiers are added fastest first.
pub struct MultiLevelCacheBuilder<K: CacheKey, V: Cacheable> {
    config: CacheConfig,
    tiers: Vec<Tier<K, V>>,
    lock_store: Option<MultiLevelCache<String, String>>,
    invalidation: Option<Arc<RemoteInvalidation<K>>>,
}

impl<K: CacheKey, V: Cacheable> MultiLevelCacheBuilder<K, V> {
    /// Append a tier below the ones already added.
    pub fn tier(mut self, tier: Tier<K, V>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Enable `try_lock` with lock entries kept in `store`. Lock keys follow
    /// the config's [`LockKeyScheme`](crate::LockKeyScheme).
    pub fn lock_store(mut self, store: MultiLevelCache<String, String>) -> Self {
        self.lock_store = Some(store);
        self
    }

    /// Publish writes and removals so other processes drop their local copies.
    pub fn remote_invalidation(mut self, invalidation: Arc<RemoteInvalidation<K>>) -> Self {
        self.invalidation = Some(invalidation);
        self
    }

    pub fn build(self) -> Result<MultiLevelCache<K, V>, CacheError> {
        if self.tiers.is_empty() {
            return Err(CacheError::NoTiers);
        }
        let locks = match self.lock_store {
            Some(store) => Some(LockManager::new(
                store,
                self.config.lock_key_scheme.clone(),
            )?),
            None => None,
        };

        Ok(MultiLevelCache {
            inner: Arc::new(MultiLevelCacheInner {
                tiers: self.tiers,
                config: self.config,
                in_flight: InFlightMap::default(),
                locks,
                invalidation: self.invalidation,
            }),
        })
    }
}

impl<K: CacheKey, V: Cacheable> MultiLevelCache<K, V> {
    pub fn builder(config: CacheConfig) -> MultiLevelCacheBuilder<K, V> {
        MultiLevelCacheBuilder {
            config,
            tiers: Vec::new(),
            lock_store: None,
            invalidation: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.inner.tiers.iter().map(Tier::name).collect()
    }

    fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The last tier, which all processes share. `build` rejects empty tier lists.
    fn authoritative_atomic(&self) -> Result<&dyn AtomicTier<K, V>, CacheError> {
        self.inner
            .tiers
            .last()
            .and_then(Tier::atomic_tier)
            .ok_or(CacheError::Unsupported(
                "authoritative tier has no atomic insert-if-absent",
            ))
    }

    /// Tiers above the authoritative one.
    fn local_tiers(&self) -> &[Tier<K, V>] {
        self.inner
            .tiers
            .split_last()
            .map(|(_, upper)| upper)
            .unwrap_or(&[])
    }

    /// The envelope to write into `tier` for a fresh write.
    fn holder_for(tier: &Tier<K, V>, holder: &CacheValueHolder<V>) -> CacheValueHolder<V> {
        match tier.ttl_override() {
            Some(ttl) => CacheValueHolder::new(holder.value().cloned(), holder.create_time(), ttl),
            None => holder.clone(),
        }
    }

    async fn publish(&self, keys: &[&K]) {
        if let Some(invalidation) = &self.inner.invalidation {
            invalidation.publish(keys).await;
        }
    }

    // ============ Reads ============

    /// Read a key through the tiers. A hit at tier *i* is copied into tiers
    /// `0..i` with its expiry unchanged.
    ///
    /// With no hit anywhere the result is `NotExists`, or `Fail` carrying the
    /// last tier error when some tier could not be read.
    pub async fn get(&self, key: &K) -> CacheGetResult<V> {
        self.get_holder(key).await.map(CacheValueHolder::into_value)
    }

    pub(crate) async fn get_holder(&self, key: &K) -> HolderResult<V> {
        let mut failure = None;

        for (index, slot) in self.inner.tiers.iter().enumerate() {
            let result = slot.tier().get(key).await;
            match result.code() {
                CacheResultCode::Success => {
                    let Some(holder) = result.into_value() else {
                        continue;
                    };
                    if holder.is_expired(now_millis()) {
                        continue;
                    }
                    debug!("{}: hit at tier {} for key {}", self.name(), slot.name(), key);
                    self.promote(index, key, &holder).await;
                    return CacheGetResult::hit(Some(holder));
                }
                CacheResultCode::Fail => {
                    failure = result.shared_error();
                }
                _ => {
                    debug!("{}: miss at tier {} for key {}", self.name(), slot.name(), key);
                }
            }
        }

        match failure {
            Some(error) => CacheGetResult::failed(error),
            None => CacheGetResult::not_exists(),
        }
    }

    async fn promote(&self, found_at: usize, key: &K, holder: &CacheValueHolder<V>) {
        for slot in &self.inner.tiers[..found_at] {
            let result = slot.tier().put(key, holder.clone()).await;
            if !result.is_success() {
                warn!(
                    "{}: failed to promote key {} into tier {}. Continuing.",
                    self.name(),
                    key,
                    slot.name()
                );
            }
        }
    }

    /// Batch read with the same per-key semantics as [`get`](Self::get), one
    /// batched lookup per tier for the keys still unresolved.
    pub async fn get_all(&self, keys: &[K]) -> MultiGetResult<K, V> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut pending: Vec<K> = keys
            .iter()
            .filter(|k| seen.insert(*k))
            .cloned()
            .collect();
        let mut resolved = HashMap::with_capacity(pending.len());
        let mut failures: HashMap<K, Arc<CacheError>> = HashMap::new();

        for (index, slot) in self.inner.tiers.iter().enumerate() {
            if pending.is_empty() {
                break;
            }

            let mut found = slot.tier().get_all(&pending).await.into_values();
            let now = now_millis();
            let mut hits = Vec::new();
            let mut unresolved = Vec::new();

            for key in pending {
                match found.remove(&key) {
                    Some(result) if result.is_success() => match result.into_value() {
                        Some(holder) if !holder.is_expired(now) => hits.push((key, holder)),
                        _ => unresolved.push(key),
                    },
                    Some(result) if result.code() == CacheResultCode::Fail => {
                        if let Some(error) = result.shared_error() {
                            failures.insert(key.clone(), error);
                        }
                        unresolved.push(key);
                    }
                    _ => unresolved.push(key),
                }
            }

            if !hits.is_empty() {
                debug!(
                    "{}: {} hits at tier {}",
                    self.name(),
                    hits.len(),
                    slot.name()
                );
                self.promote_all(index, &hits).await;
                for (key, holder) in hits {
                    resolved.insert(key, CacheGetResult::hit(holder.into_value()));
                }
            }
            pending = unresolved;
        }

        for key in pending {
            let result = match failures.remove(&key) {
                Some(error) => CacheGetResult::failed(error),
                None => CacheGetResult::not_exists(),
            };
            resolved.insert(key, result);
        }

        MultiGetResult::from_values(resolved)
    }

    async fn promote_all(&self, found_at: usize, hits: &[(K, CacheValueHolder<V>)]) {
        for slot in &self.inner.tiers[..found_at] {
            let result = slot.tier().put_all(hits.to_vec()).await;
            if !result.is_success() {
                warn!(
                    "{}: failed to promote {} keys into tier {}. Continuing.",
                    self.name(),
                    hits.len(),
                    slot.name()
                );
            }
        }
    }

    // ============ Writes ============

    /// Write with the configured default TTL. `None` caches a null.
    pub async fn put(&self, key: &K, value: Option<V>) -> CacheResult {
        self.put_with_ttl(key, value, self.inner.config.default_ttl)
            .await
    }

    /// Write one envelope to every tier, tier 0 first. `Success` only if all
    /// tiers took it, `PartSuccess` if some did, `Fail` if none did.
    pub async fn put_with_ttl(&self, key: &K, value: Option<V>, ttl: Duration) -> CacheResult {
        if !is_valid_ttl(ttl) {
            return CacheResult::fail(CacheError::InvalidTtl);
        }
        let holder = CacheValueHolder::fresh(value, ttl);

        let mut results = Vec::with_capacity(self.inner.tiers.len());
        for slot in &self.inner.tiers {
            let result = slot.tier().put(key, Self::holder_for(slot, &holder)).await;
            if !result.is_success() {
                warn!("{}: write of key {} to tier {} failed", self.name(), key, slot.name());
            }
            results.push(result);
        }

        if results.last().is_some_and(CacheResult::is_success) {
            self.publish(&[key]).await;
        }
        CacheResult::merge_writes(results)
    }

    pub async fn put_all(&self, entries: impl IntoIterator<Item = (K, Option<V>)>) -> CacheResult {
        self.put_all_with_ttl(entries, self.inner.config.default_ttl)
            .await
    }

    /// Batch write-through, one batched write per tier.
    pub async fn put_all_with_ttl(
        &self,
        entries: impl IntoIterator<Item = (K, Option<V>)>,
        ttl: Duration,
    ) -> CacheResult {
        if !is_valid_ttl(ttl) {
            return CacheResult::fail(CacheError::InvalidTtl);
        }
        let now = now_millis();
        let holders: Vec<(K, CacheValueHolder<V>)> = entries
            .into_iter()
            .map(|(key, value)| (key, CacheValueHolder::new(value, now, ttl)))
            .collect();
        if holders.is_empty() {
            return CacheResult::success();
        }

        let mut results = Vec::with_capacity(self.inner.tiers.len());
        for slot in &self.inner.tiers {
            let batch = holders
                .iter()
                .map(|(key, holder)| (key.clone(), Self::holder_for(slot, holder)))
                .collect();
            let result = slot.tier().put_all(batch).await;
            if !result.is_success() {
                warn!(
                    "{}: batch write of {} keys to tier {} returned {:?}",
                    self.name(),
                    holders.len(),
                    slot.name(),
                    result.code()
                );
            }
            results.push(result);
        }

        if results.last().is_some_and(CacheResult::is_success) {
            let keys: Vec<&K> = holders.iter().map(|(key, _)| key).collect();
            self.publish(&keys).await;
        }
        CacheResult::merge_writes(results)
    }

    /// Remove a key from every tier. `NotExists` only if no tier held it.
    pub async fn remove(&self, key: &K) -> CacheResult {
        let mut results = Vec::with_capacity(self.inner.tiers.len());
        for slot in &self.inner.tiers {
            results.push(slot.tier().remove(key).await);
        }
        let result = CacheResult::merge_removes(results);
        if result.code() != CacheResultCode::Fail {
            self.publish(&[key]).await;
        }
        result
    }

    pub async fn remove_all(&self, keys: &[K]) -> CacheResult {
        if keys.is_empty() {
            return CacheResult::success();
        }
        let mut results = Vec::with_capacity(self.inner.tiers.len());
        for slot in &self.inner.tiers {
            results.push(slot.tier().remove_all(keys).await);
        }
        let result = CacheResult::merge_removes(results);
        if result.code() != CacheResultCode::Fail {
            let keys: Vec<&K> = keys.iter().collect();
            self.publish(&keys).await;
        }
        result
    }

    /// Drop a key from every tier above the authoritative one.
    pub async fn invalidate_local(&self, key: &K) {
        for slot in self.local_tiers() {
            slot.tier().remove(key).await;
        }
    }

    // ============ Conditional insert ============

    /// Insert only if no live entry exists, decided atomically by the
    /// authoritative tier: `Success` when inserted, `Exists` otherwise.
    ///
    /// Returns `Err(CacheError::Unsupported)` when the authoritative tier has
    /// no atomic insert; a plain write would not give the same guarantee.
    pub async fn put_if_absent(
        &self,
        key: &K,
        value: Option<V>,
        ttl: Duration,
    ) -> Result<CacheResult, CacheError> {
        self.authoritative_atomic()?;
        if !is_valid_ttl(ttl) {
            return Err(CacheError::InvalidTtl);
        }
        self.put_if_absent_holder(key, CacheValueHolder::fresh(value, ttl))
            .await
    }

    pub(crate) async fn put_if_absent_holder(
        &self,
        key: &K,
        holder: CacheValueHolder<V>,
    ) -> Result<CacheResult, CacheError> {
        let atomic = self.authoritative_atomic()?;
        let result = atomic.put_if_absent(key, holder).await;
        if result.is_success() {
            // Upper tiers may still hold an entry the authoritative tier already expired.
            self.invalidate_local(key).await;
            self.publish(&[key]).await;
        }
        Ok(result)
    }

    pub(crate) async fn remove_if_matches(
        &self,
        key: &K,
        expected: &CacheValueHolder<V>,
    ) -> Result<CacheResult, CacheError> {
        let atomic = self.authoritative_atomic()?;
        Ok(atomic.remove_if_matches(key, expected).await)
    }

    // ============ Locks ============

    fn locks(&self) -> Result<&LockManager, CacheError> {
        self.inner
            .locks
            .as_ref()
            .ok_or(CacheError::Unsupported("no lock store configured"))
    }

    /// One non-blocking attempt to lock `key` for `ttl`. See [`LockManager::try_lock`].
    pub async fn try_lock(&self, key: &K, ttl: Duration) -> Result<Option<LockGuard>, CacheError> {
        self.locks()?.try_lock(key, ttl).await
    }

    /// Run `action` under the lock for `key` if it can be taken at once.
    /// See [`LockManager::try_lock_and_run`].
    pub async fn try_lock_and_run<F, Fut>(
        &self,
        key: &K,
        ttl: Duration,
        action: F,
    ) -> Result<bool, CacheError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        self.locks()?.try_lock_and_run(key, ttl, action).await
    }

    // ============ Convenience ============

    /// Value for `key`, `None` for a miss, a failure or a cached null.
    pub async fn get_value(&self, key: &K) -> Option<V> {
        self.get(key).await.into_value()
    }

    /// Values for the keys that hit with a non-null value.
    pub async fn get_all_values(&self, keys: &[K]) -> HashMap<K, V> {
        self.get_all(keys)
            .await
            .into_values()
            .into_iter()
            .filter_map(|(key, result)| result.into_value().map(|value| (key, value)))
            .collect()
    }

    pub async fn put_value(&self, key: &K, value: V) -> bool {
        self.put(key, Some(value)).await.is_success()
    }

    /// Remove `key`; `true` if some tier held it and none failed.
    pub async fn invalidate(&self, key: &K) -> bool {
        self.remove(key).await.is_success()
    }

    /// `put_if_absent` with the default TTL; `Ok(true)` when inserted.
    pub async fn insert_if_absent(&self, key: &K, value: V) -> Result<bool, CacheError> {
        let result = self
            .put_if_absent(key, Some(value), self.inner.config.default_ttl)
            .await?;
        Ok(result.is_success())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tier::{CacheTier, MokaTier};
    use crate::{ExpirePolicy, MokaTierConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn moka(name: &str, policy: ExpirePolicy) -> MokaTier<String, String> {
        MokaTier::new(
            name,
            MokaTierConfig {
                max_capacity: 1_000,
                expire_policy: policy,
            },
        )
    }

    /// Two moka tiers, the lower one atomic.
    pub(crate) fn two_level() -> MultiLevelCache<String, String> {
        MultiLevelCache::builder(CacheConfig::new("test"))
            .tier(Tier::plain(moka("l1", ExpirePolicy::AfterWrite)))
            .tier(Tier::atomic(moka("l2", ExpirePolicy::AfterWrite)))
            .build()
            .unwrap()
    }

    /// Tier whose every operation fails, counting calls.
    #[derive(Default)]
    pub(crate) struct BrokenTier {
        pub(crate) calls: AtomicUsize,
    }

    impl BrokenTier {
        fn failure(&self) -> CacheError {
            self.calls.fetch_add(1, Ordering::SeqCst);
            CacheError::Unsupported("broken tier")
        }
    }

    #[async_trait::async_trait]
    impl CacheTier<String, String> for BrokenTier {
        fn name(&self) -> &str {
            "broken"
        }

        async fn get(&self, _key: &String) -> HolderResult<String> {
            CacheGetResult::fail(self.failure())
        }

        async fn get_all(&self, keys: &[String]) -> MultiGetResult<String, CacheValueHolder<String>> {
            MultiGetResult::fail_all(keys, self.failure())
        }

        async fn put(&self, _key: &String, _holder: CacheValueHolder<String>) -> CacheResult {
            CacheResult::fail(self.failure())
        }

        async fn put_all(&self, _entries: Vec<(String, CacheValueHolder<String>)>) -> CacheResult {
            CacheResult::fail(self.failure())
        }

        async fn remove(&self, _key: &String) -> CacheResult {
            CacheResult::fail(self.failure())
        }

        async fn remove_all(&self, _keys: &[String]) -> CacheResult {
            CacheResult::fail(self.failure())
        }
    }

    fn key(s: &str) -> String {
        s.to_owned()
    }

    #[tokio::test]
    async fn test_build_requires_tiers() {
        let err = MultiLevelCache::<String, String>::builder(CacheConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::NoTiers));
    }

    #[tokio::test]
    async fn test_get_put_remove() {
        let cache = two_level();
        let k = key("BASE_K1");

        let miss = cache.get(&k).await;
        assert_eq!(miss.code(), CacheResultCode::NotExists);
        assert!(miss.value().is_none());

        assert!(cache.put(&k, Some(key("V1"))).await.is_success());
        let hit = cache.get(&k).await;
        assert_eq!(hit.code(), CacheResultCode::Success);
        assert_eq!(hit.value().map(String::as_str), Some("V1"));

        assert!(cache.put(&k, Some(key("V2"))).await.is_success());
        assert_eq!(cache.get_value(&k).await.as_deref(), Some("V2"));

        assert_eq!(cache.remove(&k).await.code(), CacheResultCode::Success);
        assert_eq!(cache.get(&k).await.code(), CacheResultCode::NotExists);
        assert_eq!(cache.remove(&k).await.code(), CacheResultCode::NotExists);
    }

    #[tokio::test]
    async fn test_null_value_is_distinct_from_absent() {
        let cache = two_level();
        let k = key("BASE_K2");

        assert!(cache.put(&k, None).await.is_success());
        let hit = cache.get(&k).await;
        assert_eq!(hit.code(), CacheResultCode::Success);
        assert!(hit.value().is_none());

        let absent = cache.get(&key("never-written")).await;
        assert_eq!(absent.code(), CacheResultCode::NotExists);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_rejected() {
        let cache = two_level();
        let result = cache.put_with_ttl(&key("k"), Some(key("v")), Duration::ZERO).await;
        assert_eq!(result.code(), CacheResultCode::Fail);
        assert!(matches!(result.error(), Some(CacheError::InvalidTtl)));
    }

    #[tokio::test]
    async fn test_sub_millisecond_ttl_is_rejected() {
        let cache = two_level();
        let k = key("short");
        let ttl = Duration::from_micros(900);

        let put = cache.put_with_ttl(&k, Some(key("v")), ttl).await;
        assert!(matches!(put.error(), Some(CacheError::InvalidTtl)));
        let batch = cache.put_all_with_ttl([(k.clone(), Some(key("v")))], ttl).await;
        assert!(matches!(batch.error(), Some(CacheError::InvalidTtl)));
        assert!(cache.get(&k).await.is_miss());

        for _ in 0..2 {
            let err = cache.put_if_absent(&k, Some(key("v")), ttl).await.unwrap_err();
            assert!(matches!(err, CacheError::InvalidTtl));
        }
        let err = cache
            .put_if_absent(&k, Some(key("v")), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidTtl));
        assert!(cache.get(&k).await.is_miss());
    }

    #[tokio::test]
    async fn test_hit_in_lower_tier_is_promoted_with_same_expiry() {
        let l1 = Arc::new(moka("l1", ExpirePolicy::AfterWrite));
        let l2 = moka("l2", ExpirePolicy::AfterWrite);
        let k = key("promoted");
        let holder = CacheValueHolder::fresh(Some(key("v")), Duration::from_secs(30));
        l2.put(&k, holder.clone()).await;

        let cache = MultiLevelCache::builder(CacheConfig::new("promote"))
            .tier(Tier::plain(Arc::clone(&l1)))
            .tier(Tier::atomic(l2))
            .build()
            .unwrap();

        assert_eq!(l1.get(&k).await.code(), CacheResultCode::NotExists);
        assert_eq!(cache.get_value(&k).await.as_deref(), Some("v"));

        let promoted = l1.get(&k).await;
        assert!(promoted.is_success());
        assert_eq!(
            promoted.value().map(|h| h.expire_time()),
            Some(holder.expire_time())
        );
    }

    #[tokio::test]
    async fn test_failing_tier_does_not_block_lower_hit() {
        let broken = Arc::new(BrokenTier::default());
        let cache = MultiLevelCache::builder(CacheConfig::new("broken"))
            .tier(Tier::plain(Arc::clone(&broken)))
            .tier(Tier::atomic(moka("l2", ExpirePolicy::AfterWrite)))
            .build()
            .unwrap();
        let k = key("k");

        let write = cache.put(&k, Some(key("v"))).await;
        assert_eq!(write.code(), CacheResultCode::PartSuccess);

        let read = cache.get(&k).await;
        assert!(read.is_success());
        assert_eq!(read.value().map(String::as_str), Some("v"));

        let missing = cache.get(&key("missing")).await;
        assert_eq!(missing.code(), CacheResultCode::Fail);
        assert!(cache.get_value(&key("missing")).await.is_none());
        assert!(broken.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_all_tiers_failing_is_fail() {
        let cache = MultiLevelCache::builder(CacheConfig::new("broken"))
            .tier(Tier::plain(BrokenTier::default()))
            .build()
            .unwrap();
        assert_eq!(
            cache.put(&key("k"), Some(key("v"))).await.code(),
            CacheResultCode::Fail
        );
        assert!(!cache.put_value(&key("k"), key("v")).await);
    }

    #[tokio::test]
    async fn test_batch_round_trip() {
        let cache = two_level();
        let (k1, k2, k3) = (key("getAll_K1"), key("getAll_K2"), key("getAll_K3"));

        let written = cache
            .put_all([(k1.clone(), Some(key("V1"))), (k2.clone(), Some(key("V2")))])
            .await;
        assert!(written.is_success());

        let result = cache.get_all(&[k1.clone(), k2.clone(), k3.clone()]).await;
        assert!(result.is_success());
        assert_eq!(result.values().len(), 3);
        assert_eq!(
            result.get(&k1).and_then(|r| r.value()).map(String::as_str),
            Some("V1")
        );
        assert_eq!(
            result.get(&k2).and_then(|r| r.value()).map(String::as_str),
            Some("V2")
        );
        assert_eq!(
            result.get(&k3).map(|r| r.code()),
            Some(CacheResultCode::NotExists)
        );

        let values = cache.get_all_values(&[k1.clone(), k2.clone(), k3.clone()]).await;
        assert_eq!(values.len(), 2);
        assert!(cache.get_all_values(&[]).await.is_empty());

        assert!(cache.remove_all(&[k1.clone(), k2.clone()]).await.is_success());
        assert!(cache.get_value(&k1).await.is_none());
        assert!(cache.get_value(&k2).await.is_none());
    }

    #[tokio::test]
    async fn test_get_all_promotes_lower_hits() {
        let l1 = Arc::new(moka("l1", ExpirePolicy::AfterWrite));
        let l2 = moka("l2", ExpirePolicy::AfterWrite);
        let k = key("batch-promoted");
        l2.put(&k, CacheValueHolder::fresh(Some(key("v")), Duration::from_secs(30)))
            .await;

        let cache = MultiLevelCache::builder(CacheConfig::new("promote"))
            .tier(Tier::plain(Arc::clone(&l1)))
            .tier(Tier::atomic(l2))
            .build()
            .unwrap();

        let result = cache.get_all(&[k.clone(), k.clone()]).await;
        assert_eq!(result.values().len(), 1);
        assert!(l1.get(&k).await.is_success());
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let cache = two_level();
        let k = key("PIA_K1");
        let ttl = Duration::from_secs(10);

        let first = cache.put_if_absent(&k, Some(key("V1")), ttl).await.unwrap();
        assert_eq!(first.code(), CacheResultCode::Success);
        let second = cache.put_if_absent(&k, Some(key("V2")), ttl).await.unwrap();
        assert_eq!(second.code(), CacheResultCode::Exists);
        assert_eq!(cache.get_value(&k).await.as_deref(), Some("V1"));

        assert!(cache.invalidate(&k).await);
        assert!(cache.insert_if_absent(&k, key("V3")).await.unwrap());
        assert!(!cache.insert_if_absent(&k, key("V4")).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_if_absent_needs_atomic_authoritative_tier() {
        let cache = MultiLevelCache::builder(CacheConfig::new("plain"))
            .tier(Tier::plain(moka("l1", ExpirePolicy::AfterWrite)))
            .build()
            .unwrap();
        let err = cache
            .put_if_absent(&key("k"), Some(key("v")), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));
        // Plain write was not attempted in its place.
        assert!(cache.get(&key("k")).await.is_miss());
    }

    #[tokio::test]
    async fn test_ttl_override_applies_to_fresh_writes() {
        let l1 = Arc::new(moka("l1", ExpirePolicy::AfterWrite));
        let cache = MultiLevelCache::builder(CacheConfig::new("override"))
            .tier(Tier::plain(Arc::clone(&l1)).with_ttl(Duration::from_millis(100)))
            .tier(Tier::atomic(moka("l2", ExpirePolicy::AfterWrite)))
            .build()
            .unwrap();
        let k = key("k");
        cache
            .put_with_ttl(&k, Some(key("v")), Duration::from_secs(60))
            .await;

        let local = l1.get(&k).await;
        let holder = local.value().unwrap();
        assert_eq!(holder.init_ttl(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_expire_after_write() {
        let cache = two_level();
        let k = key("EXPIRE_W_K1");
        let ttl = Duration::from_millis(200);
        cache.put_with_ttl(&k, Some(key("V1")), ttl).await;

        assert!(cache.get(&k).await.is_success());
        tokio::time::sleep(ttl / 2).await;
        assert_eq!(cache.get_value(&k).await.as_deref(), Some("V1"));
        tokio::time::sleep(ttl / 2 + Duration::from_millis(20)).await;

        let expired = cache.get(&k).await;
        assert!(expired.is_miss());
        assert!(expired.value().is_none());
    }

    #[tokio::test]
    async fn test_expire_after_access() {
        let cache = MultiLevelCache::builder(CacheConfig::new("access"))
            .tier(Tier::atomic(moka("l1", ExpirePolicy::AfterAccess)))
            .build()
            .unwrap();
        let k = key("EXPIRE_A_K1");
        let ttl = Duration::from_millis(300);
        cache.put_with_ttl(&k, Some(key("V1")), ttl).await;

        for _ in 0..4 {
            tokio::time::sleep(ttl / 2).await;
            assert_eq!(cache.get_value(&k).await.as_deref(), Some("V1"));
        }

        tokio::time::sleep(ttl + Duration::from_millis(30)).await;
        assert!(cache.get(&k).await.is_miss());
    }

    #[tokio::test]
    async fn test_invalidate_local_keeps_authoritative_copy() {
        let l1 = Arc::new(moka("l1", ExpirePolicy::AfterWrite));
        let cache = MultiLevelCache::builder(CacheConfig::new("local"))
            .tier(Tier::plain(Arc::clone(&l1)))
            .tier(Tier::atomic(moka("l2", ExpirePolicy::AfterWrite)))
            .build()
            .unwrap();
        let k = key("k");
        cache.put(&k, Some(key("v"))).await;

        cache.invalidate_local(&k).await;
        assert!(l1.get(&k).await.is_miss());
        assert_eq!(cache.get_value(&k).await.as_deref(), Some("v"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_get_remove() {
        let cache = two_level();
        let mut tasks = Vec::new();
        for t in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..50 {
                    let k = format!("T{t}_{i}");
                    let v = format!("{}", i * t);
                    assert!(cache.put(&k, Some(v.clone())).await.is_success());
                    let got = cache.get(&k).await;
                    assert!(got.is_success());
                    assert_eq!(got.value(), Some(&v));
                    let removed = cache.remove(&k).await;
                    assert!(matches!(
                        removed.code(),
                        CacheResultCode::Success | CacheResultCode::NotExists
                    ));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }
}
