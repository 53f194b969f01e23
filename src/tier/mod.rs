//! Storage tier capability interfaces
//!
//! A tier is anything that can store envelopes by key. Tiers report failures
//! inside their results instead of returning errors, so the engine can carry
//! on with the next tier. Tiers that can also insert-if-absent atomically
//! implement [`AtomicTier`]; only those can be authoritative for conditional
//! inserts and locks.

use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::{CacheGetResult, CacheResult, CacheValueHolder, MultiGetResult};

mod moka_tier;
mod redis_tier;

pub use moka_tier::MokaTier;
pub use redis_tier::RedisTier;

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Trait for cache key types
pub trait CacheKey: Display + Hash + Eq + Clone + Send + Sync + 'static {}
impl<T> CacheKey for T where T: Display + Hash + Eq + Clone + Send + Sync + 'static {}

/// Result of reading an envelope from a tier
pub type HolderResult<V> = CacheGetResult<CacheValueHolder<V>>;

/// Basic capability set every tier provides.
#[async_trait::async_trait]
pub trait CacheTier<K: CacheKey, V: Cacheable>: Send + Sync {
    /// Short name for log lines
    fn name(&self) -> &str;

    async fn get(&self, key: &K) -> HolderResult<V>;

    async fn get_all(&self, keys: &[K]) -> MultiGetResult<K, CacheValueHolder<V>>;

    /// Store the envelope as given; its expiry is not recomputed.
    async fn put(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult;

    async fn put_all(&self, entries: Vec<(K, CacheValueHolder<V>)>) -> CacheResult;

    /// `NotExists` when nothing was stored under the key.
    async fn remove(&self, key: &K) -> CacheResult;

    async fn remove_all(&self, keys: &[K]) -> CacheResult;
}

/// A shared tier, so a caller can keep a handle on a tier it hands to an engine.
#[async_trait::async_trait]
impl<K, V, T> CacheTier<K, V> for Arc<T>
where
    K: CacheKey,
    V: Cacheable,
    T: CacheTier<K, V> + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self, key: &K) -> HolderResult<V> {
        (**self).get(key).await
    }

    async fn get_all(&self, keys: &[K]) -> MultiGetResult<K, CacheValueHolder<V>> {
        (**self).get_all(keys).await
    }

    async fn put(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult {
        (**self).put(key, holder).await
    }

    async fn put_all(&self, entries: Vec<(K, CacheValueHolder<V>)>) -> CacheResult {
        (**self).put_all(entries).await
    }

    async fn remove(&self, key: &K) -> CacheResult {
        (**self).remove(key).await
    }

    async fn remove_all(&self, keys: &[K]) -> CacheResult {
        (**self).remove_all(keys).await
    }
}

/// Tiers offering atomic test-and-set per key.
#[async_trait::async_trait]
pub trait AtomicTier<K: CacheKey, V: Cacheable>: CacheTier<K, V> {
    /// Insert only when no live entry exists: `Success` if inserted, `Exists`
    /// otherwise. An expired entry counts as absent.
    async fn put_if_absent(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult;

    /// Delete the entry only if it still holds the write `expected` came from:
    /// `Success` if deleted, `NotExists` if the key is gone or holds another write.
    async fn remove_if_matches(&self, key: &K, expected: &CacheValueHolder<V>) -> CacheResult;
}

/// One slot in a multi-level cache: the tier plus what the engine knows about it.
pub struct Tier<K: CacheKey, V: Cacheable> {
    base: Arc<dyn CacheTier<K, V>>,
    atomic: Option<Arc<dyn AtomicTier<K, V>>>,
    ttl_override: Option<Duration>,
}

impl<K: CacheKey, V: Cacheable> Tier<K, V> {
    /// A tier without atomic insert.
    pub fn plain<T: CacheTier<K, V> + 'static>(tier: T) -> Self {
        Self {
            base: Arc::new(tier),
            atomic: None,
            ttl_override: None,
        }
    }

    /// A tier that can host conditional inserts and locks.
    pub fn atomic<T: AtomicTier<K, V> + 'static>(tier: T) -> Self {
        let tier = Arc::new(tier);
        Self {
            base: Arc::clone(&tier) as Arc<dyn CacheTier<K, V>>,
            atomic: Some(tier),
            ttl_override: None,
        }
    }

    /// Fresh writes to this tier use `ttl` instead of the caller's TTL.
    /// Promotions keep the promoted envelope's expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_override = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    pub fn supports_atomic_insert(&self) -> bool {
        self.atomic.is_some()
    }

    pub(crate) fn tier(&self) -> &dyn CacheTier<K, V> {
        self.base.as_ref()
    }

    pub(crate) fn atomic_tier(&self) -> Option<&dyn AtomicTier<K, V>> {
        self.atomic.as_deref()
    }

    pub(crate) fn ttl_override(&self) -> Option<Duration> {
        self.ttl_override
    }
}

/// Trait for generating remote tier keys and parsing them back
pub trait KeyFormatter<K>: Send + Sync + 'static {
    /// Build the string key used by a remote tier
    fn format_key(&self, key: &K) -> String;

    /// Parse a formatted key back into the key type.
    fn parse_key(&self, _formatted: &str) -> Option<K> {
        None
    }
}

/// Formats keys as `"{prefix}{key}"` and parses them back with `FromStr`.
#[derive(Debug, Clone)]
pub struct PrefixKeyFormatter {
    prefix: String,
}

impl PrefixKeyFormatter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl<K> KeyFormatter<K> for PrefixKeyFormatter
where
    K: Display + FromStr + 'static,
{
    fn format_key(&self, key: &K) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn parse_key(&self, formatted: &str) -> Option<K> {
        formatted.strip_prefix(&self.prefix)?.parse().ok()
    }
}
