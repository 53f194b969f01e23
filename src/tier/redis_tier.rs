//! Remote tier backed by Redis
//!
//! Envelopes are encoded with a [`ValueCodec`] and stored with a `PX` expiry
//! equal to their remaining lifetime, so Redis evicts them on its own while
//! reads still check the envelope.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use redis::{AsyncCommands, RedisResult, aio::ConnectionManager};
use tracing::{debug, warn};

use super::{AtomicTier, CacheKey, CacheTier, Cacheable, HolderResult, KeyFormatter};
use crate::{
    CacheError, CacheGetResult, CacheResult, CacheValueHolder, ExpirePolicy, JsonCodec,
    MultiGetResult, RedisTierConfig, ValueCodec, now_millis,
};

/// Deletes `KEYS[1]` only while it still holds exactly `ARGV[1]`.
static COMPARE_AND_DELETE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end",
    )
});

/// Rewrites `KEYS[1]` as `ARGV[2]` with a `PX` of `ARGV[3]` only while it still
/// holds exactly `ARGV[1]`.
static COMPARE_AND_REFRESH: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
else
    return 0
end",
    )
});

/// Shared tier on a Redis server.
pub struct RedisTier<K: CacheKey, V: Cacheable> {
    name: String,
    redis: ConnectionManager,
    key_formatter: Arc<dyn KeyFormatter<K>>,
    codec: Arc<dyn ValueCodec<V>>,
    config: RedisTierConfig,
}

impl<K: CacheKey, V: Cacheable> RedisTier<K, V> {
    /// Connect a new tier using the JSON codec.
    pub async fn new(
        name: impl Into<String>,
        redis_client: redis::Client,
        key_formatter: impl KeyFormatter<K>,
        config: RedisTierConfig,
    ) -> Result<Self, redis::RedisError> {
        let redis = ConnectionManager::new(redis_client).await?;
        Ok(Self::from_connection(name, redis, key_formatter, config))
    }

    /// Build a tier over an existing connection manager.
    pub fn from_connection(
        name: impl Into<String>,
        redis: ConnectionManager,
        key_formatter: impl KeyFormatter<K>,
        config: RedisTierConfig,
    ) -> Self {
        Self {
            name: name.into(),
            redis,
            key_formatter: Arc::new(key_formatter),
            codec: Arc::new(JsonCodec),
            config,
        }
    }

    pub fn with_codec(mut self, codec: impl ValueCodec<V>) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Remaining lifetime in whole milliseconds, `None` if nothing is left.
    fn px_millis(holder: &CacheValueHolder<V>, now: u64) -> Option<u64> {
        holder
            .remaining(now)
            .map(|d| d.as_millis() as u64)
            .filter(|ms| *ms > 0)
    }

    /// Decode a stored envelope and apply expiry checks and sliding refresh.
    async fn read_envelope(&self, key: &K, redis_key: &str, bytes: &[u8]) -> HolderResult<V> {
        let holder = match self.codec.decode(bytes) {
            Ok(holder) => holder,
            Err(e) => {
                warn!(
                    "{}: failed to decode cached value for key {}: {}. Deleting corrupt entry.",
                    self.name, key, e
                );
                let mut conn = self.redis.clone();
                if let Err(del_err) = conn.del::<_, ()>(redis_key).await {
                    warn!(
                        "{}: failed to delete corrupt entry for key {} (Redis key: {}): {}",
                        self.name, key, redis_key, del_err
                    );
                }
                return CacheGetResult::fail(e);
            }
        };

        let now = now_millis();
        if holder.is_expired(now) {
            debug!("{}: entry for key {} has expired", self.name, key);
            return CacheGetResult::expired();
        }

        if self.config.expire_policy == ExpirePolicy::AfterAccess {
            let refreshed = holder.refreshed(now);
            self.refresh(key, redis_key, bytes, &refreshed, now).await;
            return CacheGetResult::hit(Some(refreshed));
        }

        CacheGetResult::hit(Some(holder))
    }

    /// Best-effort rewrite of a refreshed envelope, only while the key still
    /// holds the `original` bytes it was read from. Returns whether it was
    /// rewritten.
    async fn refresh(
        &self,
        key: &K,
        redis_key: &str,
        original: &[u8],
        refreshed: &CacheValueHolder<V>,
        now: u64,
    ) -> bool {
        let (Ok(bytes), Some(px)) = (self.codec.encode(refreshed), Self::px_millis(refreshed, now))
        else {
            return false;
        };
        let mut conn = self.redis.clone();
        let reply: RedisResult<redis::Value> = COMPARE_AND_REFRESH
            .key(redis_key)
            .arg(original)
            .arg(bytes)
            .arg(px)
            .invoke_async(&mut conn)
            .await;
        match reply {
            Ok(redis::Value::Int(0)) => {
                debug!("{}: key {} was rewritten, skipping refresh", self.name, key);
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(
                    "{}: failed to refresh expiry for key {}: {}. Continuing.",
                    self.name, key, e
                );
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl<K: CacheKey, V: Cacheable> CacheTier<K, V> for RedisTier<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> HolderResult<V> {
        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();

        let cached = match conn.get::<_, Option<Vec<u8>>>(&redis_key).await {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: GET error for key {}: {}", self.name, key, e);
                return CacheGetResult::fail(e.into());
            }
        };

        match cached {
            Some(bytes) => self.read_envelope(key, &redis_key, &bytes).await,
            None => CacheGetResult::not_exists(),
        }
    }

    async fn get_all(&self, keys: &[K]) -> MultiGetResult<K, CacheValueHolder<V>> {
        if keys.is_empty() {
            return MultiGetResult::from_values(HashMap::new());
        }

        let redis_keys: Vec<String> = keys
            .iter()
            .map(|k| self.key_formatter.format_key(k))
            .collect();
        let mut conn = self.redis.clone();
        let reply: RedisResult<Vec<Option<Vec<u8>>>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await;

        let cached = match reply {
            Ok(cached) => cached,
            Err(e) => {
                warn!("{}: MGET error for {} keys: {}", self.name, keys.len(), e);
                return MultiGetResult::fail_all(keys, e.into());
            }
        };

        let mut values = HashMap::with_capacity(keys.len());
        for ((key, redis_key), bytes) in keys.iter().zip(&redis_keys).zip(cached) {
            let result = match bytes {
                Some(bytes) => self.read_envelope(key, redis_key, &bytes).await,
                None => CacheGetResult::not_exists(),
            };
            values.insert(key.clone(), result);
        }
        MultiGetResult::from_values(values)
    }

    async fn put(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult {
        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();

        // An envelope with no life left replaces the entry with nothing.
        let Some(px) = Self::px_millis(&holder, now_millis()) else {
            debug!("{}: envelope for key {} already expired, deleting", self.name, key);
            return match conn.del::<_, ()>(&redis_key).await {
                Ok(()) => CacheResult::success(),
                Err(e) => {
                    warn!(
                        "{}: DEL error for key {} (Redis key: {}): {}",
                        self.name, key, redis_key, e
                    );
                    CacheResult::fail(e.into())
                }
            };
        };
        let bytes = match self.codec.encode(&holder) {
            Ok(bytes) => bytes,
            Err(e) => return CacheResult::fail(e),
        };


        let reply: RedisResult<()> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(bytes)
            .arg("PX")
            .arg(px)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(()) => CacheResult::success(),
            Err(e) => {
                warn!(
                    "{}: SET error for key {} (Redis key: {}): {}",
                    self.name, key, redis_key, e
                );
                CacheResult::fail(e.into())
            }
        }
    }

    async fn put_all(&self, entries: Vec<(K, CacheValueHolder<V>)>) -> CacheResult {
        let now = now_millis();
        let mut outcomes = Vec::with_capacity(entries.len());
        let mut pipe = redis::pipe();
        pipe.atomic();
        let mut queued = 0usize;

        for (key, holder) in &entries {
            let Some(px) = Self::px_millis(holder, now) else {
                pipe.cmd("DEL").arg(self.key_formatter.format_key(key)).ignore();
                queued += 1;
                continue;
            };
            match self.codec.encode(holder) {
                Ok(bytes) => {
                    pipe.cmd("SET")
                        .arg(self.key_formatter.format_key(key))
                        .arg(bytes)
                        .arg("PX")
                        .arg(px)
                        .ignore();
                    queued += 1;
                }
                Err(e) => {
                    warn!("{}: failed to encode value for key {}: {}", self.name, key, e);
                    outcomes.push(CacheResult::fail(e));
                }
            }
        }

        if queued > 0 {
            let mut conn = self.redis.clone();
            let reply: RedisResult<()> = pipe.query_async(&mut conn).await;
            match reply {
                Ok(()) => outcomes.extend((0..queued).map(|_| CacheResult::success())),
                Err(e) => {
                    warn!("{}: pipelined write of {} keys failed: {}", self.name, queued, e);
                    let error = Arc::new(CacheError::from(e));
                    outcomes.extend((0..queued).map(|_| CacheResult::failed(Arc::clone(&error))));
                }
            }
        }

        CacheResult::merge_writes(outcomes)
    }

    async fn remove(&self, key: &K) -> CacheResult {
        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();
        match conn.del::<_, i64>(&redis_key).await {
            Ok(0) => CacheResult::not_exists(),
            Ok(_) => CacheResult::success(),
            Err(e) => {
                warn!(
                    "{}: DEL error for key {} (Redis key: {}): {}",
                    self.name, key, redis_key, e
                );
                CacheResult::fail(e.into())
            }
        }
    }

    async fn remove_all(&self, keys: &[K]) -> CacheResult {
        if keys.is_empty() {
            return CacheResult::success();
        }
        let redis_keys: Vec<String> = keys
            .iter()
            .map(|k| self.key_formatter.format_key(k))
            .collect();
        let mut conn = self.redis.clone();
        match conn.del::<_, ()>(&redis_keys).await {
            Ok(()) => CacheResult::success(),
            Err(e) => {
                warn!("{}: DEL error for {} keys: {}", self.name, keys.len(), e);
                CacheResult::fail(e.into())
            }
        }
    }
}

#[async_trait::async_trait]
impl<K: CacheKey, V: Cacheable> AtomicTier<K, V> for RedisTier<K, V> {
    async fn put_if_absent(&self, key: &K, holder: CacheValueHolder<V>) -> CacheResult {
        let Some(px) = Self::px_millis(&holder, now_millis()) else {
            return CacheResult::fail(CacheError::InvalidTtl);
        };
        let bytes = match self.codec.encode(&holder) {
            Ok(bytes) => bytes,
            Err(e) => return CacheResult::fail(e),
        };

        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();
        let reply: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(bytes)
            .arg("NX")
            .arg("PX")
            .arg(px)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(Some(_)) => CacheResult::success(),
            Ok(None) => CacheResult::exists(),
            Err(e) => {
                warn!("{}: SET NX error for key {}: {}", self.name, key, e);
                CacheResult::fail(e.into())
            }
        }
    }

    /// Compares the encoded envelope, so an entry rewritten by a sliding
    /// refresh no longer matches the envelope that created it.
    async fn remove_if_matches(&self, key: &K, expected: &CacheValueHolder<V>) -> CacheResult {
        let bytes = match self.codec.encode(expected) {
            Ok(bytes) => bytes,
            Err(e) => return CacheResult::fail(e),
        };

        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();
        let reply: RedisResult<i64> = COMPARE_AND_DELETE
            .key(&redis_key)
            .arg(bytes)
            .invoke_async(&mut conn)
            .await;

        match reply {
            Ok(0) => CacheResult::not_exists(),
            Ok(_) => CacheResult::success(),
            Err(e) => {
                warn!("{}: compare-and-delete error for key {}: {}", self.name, key, e);
                CacheResult::fail(e.into())
            }
        }
    }
}
