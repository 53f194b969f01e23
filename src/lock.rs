//! Non-blocking distributed lock on top of a multi-level cache
//!
//! A lock is an entry under a derived key whose value is a random token,
//! written with the authoritative tier's atomic insert-if-absent. Only the
//! guard holding the token can delete it; an expired lock simply lapses.

use std::fmt::{self, Display};
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::holder::is_valid_ttl;
use crate::{CacheError, CacheResultCode, CacheValueHolder, LockKeyScheme, MultiLevelCache, Tier};

type LockStore = MultiLevelCache<String, String>;

/// Acquires locks in a lock store.
#[derive(Clone)]
pub struct LockManager {
    store: LockStore,
    scheme: LockKeyScheme,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.store)
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl LockManager {
    /// The store's authoritative tier must support atomic insert-if-absent.
    pub fn new(store: LockStore, scheme: LockKeyScheme) -> Result<Self, CacheError> {
        let atomic = store
            .inner
            .tiers
            .last()
            .is_some_and(Tier::supports_atomic_insert);
        if !atomic {
            return Err(CacheError::Unsupported(
                "lock store needs an atomic authoritative tier",
            ));
        }
        Ok(Self { store, scheme })
    }

    /// Make one attempt to lock `key` for `ttl`.
    ///
    /// Returns `Ok(None)` at once when the lock is held by anyone, this caller
    /// included, or when the store could not be written. There is no retry.
    pub async fn try_lock(
        &self,
        key: &impl Display,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, CacheError> {
        if !is_valid_ttl(ttl) {
            return Err(CacheError::InvalidTtl);
        }
        let lock_key = self.scheme.lock_key(key);
        let holder = CacheValueHolder::fresh(Some(Uuid::new_v4().to_string()), ttl);

        let result = self
            .store
            .put_if_absent_holder(&lock_key, holder.clone())
            .await?;
        match result.code() {
            CacheResultCode::Success => {
                debug!("Acquired lock {} for {:?}", lock_key, ttl);
                Ok(Some(LockGuard {
                    store: self.store.clone(),
                    key: lock_key,
                    holder: Some(holder),
                }))
            }
            CacheResultCode::Exists => {
                debug!("Lock {} is held elsewhere", lock_key);
                Ok(None)
            }
            code => {
                warn!(
                    "Failed to acquire lock {} ({:?}): {:?}",
                    lock_key,
                    code,
                    result.error()
                );
                Ok(None)
            }
        }
    }

    /// Run `action` under the lock if it can be taken now, then release it.
    /// `Ok(false)` means the lock was not acquired and `action` did not run.
    pub async fn try_lock_and_run<F, Fut>(
        &self,
        key: &impl Display,
        ttl: Duration,
        action: F,
    ) -> Result<bool, CacheError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ()> + Send,
    {
        let Some(guard) = self.try_lock(key, ttl).await? else {
            return Ok(false);
        };
        action().await;
        guard.release().await;
        Ok(true)
    }
}

/// A held lock. Release it with [`release`](Self::release); dropping it
/// releases in the background on the current tokio runtime.
pub struct LockGuard {
    store: LockStore,
    key: String,
    holder: Option<CacheValueHolder<String>>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl LockGuard {
    /// Key of the lock entry
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delete the lock entry if it is still ours. `false` when it had already
    /// expired, was taken over by another holder, or could not be deleted.
    pub async fn release(mut self) -> bool {
        match self.holder.take() {
            Some(holder) => release_entry(&self.store, &self.key, &holder).await,
            None => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let key = std::mem::take(&mut self.key);
                handle.spawn(async move {
                    release_entry(&store, &key, &holder).await;
                });
            }
            Err(_) => warn!(
                "Lock {} dropped outside a tokio runtime, leaving it to expire",
                self.key
            ),
        }
    }
}

async fn release_entry(store: &LockStore, key: &String, holder: &CacheValueHolder<String>) -> bool {
    match store.remove_if_matches(key, holder).await {
        Ok(result) if result.is_success() => {
            debug!("Released lock {}", key);
            true
        }
        Ok(result) if result.code() == CacheResultCode::Fail => {
            warn!("Failed to release lock {}: {:?}", key, result.error());
            false
        }
        Ok(_) => {
            debug!("Lock {} had expired or changed hands before release", key);
            false
        }
        Err(e) => {
            warn!("Failed to release lock {}: {}", key, e);
            false
        }
    }
}
