//! Read-through cache bound to a loader
//!
//! `LoadingCache` pairs a [`MultiLevelCache`] with a [`Loader`] so that reads
//! fall back to the backing store on a miss, coalesced per key.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, warn};

use crate::tier::{CacheKey, Cacheable};
use crate::{CacheError, CacheResultCode, ComputeOptions, LoaderError, MultiLevelCache};

/// Trait for fetching data from the backing store
#[async_trait::async_trait]
pub trait Loader<K, V>: Send + Sync {
    /// Fetch a value by key; `Ok(None)` when the store has nothing for it.
    async fn load(&self, key: &K) -> Result<Option<V>, LoaderError>;
}

pub struct LoadingCache<K: CacheKey, V: Cacheable, L> {
    cache: MultiLevelCache<K, V>,
    loader: Arc<L>,
}

impl<K: CacheKey, V: Cacheable, L> Clone for LoadingCache<K, V, L> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            loader: Arc::clone(&self.loader),
        }
    }
}

impl<K, V, L> LoadingCache<K, V, L>
where
    K: CacheKey,
    V: Cacheable,
    L: Loader<K, V> + 'static,
{
    pub fn new(cache: MultiLevelCache<K, V>, loader: L) -> Self {
        Self {
            cache,
            loader: Arc::new(loader),
        }
    }

    /// The underlying engine, for writes that bypass the loader.
    pub fn cache(&self) -> &MultiLevelCache<K, V> {
        &self.cache
    }

    /// Cached value, or the loaded one on a miss.
    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        self.get_with(key, ComputeOptions::default()).await
    }

    pub async fn get_with(&self, key: &K, options: ComputeOptions) -> Result<Option<V>, CacheError> {
        let loader = Arc::clone(&self.loader);
        self.cache
            .compute_if_absent_with(key, move || async move { loader.load(key).await }, options)
            .await
    }

    /// Non-null values for `keys`, loading those missing from every tier.
    /// The first loader error fails the whole call.
    pub async fn get_all(&self, keys: &[K]) -> Result<HashMap<K, V>, CacheError> {
        let cached = self.cache.get_all(keys).await.into_values();
        let mut values = HashMap::with_capacity(cached.len());
        let mut missing = Vec::new();

        for (key, result) in cached {
            if result.is_success() {
                if let Some(value) = result.into_value() {
                    values.insert(key, value);
                }
            } else {
                missing.push(key);
            }
        }

        if !missing.is_empty() {
            debug!(
                "{}: loading {} keys missing from cache",
                self.cache.config().name,
                missing.len()
            );
            let loaded = try_join_all(missing.iter().map(|key| self.get(key))).await?;
            for (key, value) in missing.into_iter().zip(loaded) {
                if let Some(value) = value {
                    values.insert(key, value);
                }
            }
        }
        Ok(values)
    }

    /// Load `key` from the store regardless of what is cached and write the
    /// result through. A `None` removes the entry unless nulls are cached.
    pub async fn refresh(&self, key: &K) -> Result<Option<V>, CacheError> {
        let value = self.loader.load(key).await.map_err(CacheError::loader)?;
        let written = if value.is_some() || self.cache.config().cache_null_value {
            self.cache.put(key, value.clone()).await
        } else {
            self.cache.remove(key).await
        };
        if !matches!(
            written.code(),
            CacheResultCode::Success | CacheResultCode::NotExists
        ) {
            warn!(
                "{}: refreshed key {} but caching it returned {:?}",
                self.cache.config().name,
                key,
                written.code()
            );
        }
        Ok(value)
    }

    /// Remove `key` from every tier; the next read loads it again.
    pub async fn invalidate(&self, key: &K) -> bool {
        self.cache.invalidate(key).await
    }
}
