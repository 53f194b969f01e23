//! tiercache - Multi-level caching library
//!
//! This library composes an ordered list of cache tiers into one cache:
//! - Tier 0 is the fastest (in-memory Moka), the last tier is authoritative
//!   and typically shared across processes (Redis)
//! - Reads fall through the tiers and promote hits upward
//! - Writes and removals go through to every tier
//!
//! On top of the engine it offers:
//! - Expiry after write or after access, with cached nulls
//! - Insert-if-absent decided by the authoritative tier
//! - A non-blocking distributed lock with token-checked release
//! - Compute-on-miss with per-key request coalescing
//! - Redis pub/sub invalidation of other processes' local tiers

mod codec;
mod config;
mod error;
mod holder;
mod invalidation;
mod loading;
mod lock;
mod multi_level;
mod result;
mod single_flight;
pub mod tier;

pub use codec::{JsonCodec, ValueCodec};
pub use config::{CacheConfig, ExpirePolicy, LockKeyScheme, MokaTierConfig, RedisTierConfig};
pub use error::{CacheError, LoaderError};
pub use holder::{CacheValueHolder, now_millis};
pub use invalidation::{InvalidationHandle, RemoteInvalidation};
pub use loading::{Loader, LoadingCache};
pub use lock::{LockGuard, LockManager};
pub use multi_level::{MultiLevelCache, MultiLevelCacheBuilder};
pub use result::{CacheGetResult, CacheResult, CacheResultCode, MultiGetResult};
pub use single_flight::ComputeOptions;
pub use tier::{
    AtomicTier, CacheKey, CacheTier, Cacheable, KeyFormatter, MokaTier, PrefixKeyFormatter,
    RedisTier, Tier,
};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
