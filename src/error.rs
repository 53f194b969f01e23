//! Cache error types

use std::sync::Arc;
use std::time::Duration;

use redis::RedisError;

/// Error type returned by loaders.
pub type LoaderError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The loader of a compute-on-miss call failed. Shared between the caller
    /// that ran the loader and every caller coalesced onto that run.
    #[error("Loader error: {0}")]
    Loader(Arc<dyn std::error::Error + Send + Sync>),

    #[error("In-flight load was cancelled or panicked")]
    LoadAborted,

    #[error("Timed out after {0:?} waiting for an in-flight load")]
    WaitTimeout(Duration),

    #[error("TTL must be greater than zero")]
    InvalidTtl,

    /// A capability the operation needs is missing, e.g. an atomic
    /// insert-if-absent on the authoritative tier.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    #[error("A multi-level cache needs at least one tier")]
    NoTiers,
}

impl CacheError {
    pub(crate) fn loader(err: LoaderError) -> Self {
        CacheError::Loader(Arc::from(err))
    }
}
