//! Uniform operation results
//!
//! Tier failures are carried inside these results instead of being returned
//! as errors, so the engine can fall through to the next tier on reads and
//! aggregate outcomes on writes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::CacheError;

/// Outcome of a cache operation (not the stored value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheResultCode {
    Success,
    /// No entry for the key.
    NotExists,
    /// An entry was found but it had expired. Equivalent to `NotExists` for callers.
    Expired,
    /// Conditional insert found a live entry.
    Exists,
    Fail,
    /// A multi-tier or multi-key write only partly succeeded.
    PartSuccess,
}

/// Result of a write, remove, batch write or conditional insert.
#[derive(Debug, Clone)]
pub struct CacheResult {
    code: CacheResultCode,
    error: Option<Arc<CacheError>>,
}

impl CacheResult {
    pub fn new(code: CacheResultCode) -> Self {
        Self { code, error: None }
    }

    pub fn success() -> Self {
        Self::new(CacheResultCode::Success)
    }

    pub fn not_exists() -> Self {
        Self::new(CacheResultCode::NotExists)
    }

    pub fn exists() -> Self {
        Self::new(CacheResultCode::Exists)
    }

    pub fn fail(error: CacheError) -> Self {
        Self::failed(Arc::new(error))
    }

    pub(crate) fn failed(error: Arc<CacheError>) -> Self {
        Self {
            code: CacheResultCode::Fail,
            error: Some(error),
        }
    }

    pub fn code(&self) -> CacheResultCode {
        self.code
    }

    pub fn error(&self) -> Option<&CacheError> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.code == CacheResultCode::Success
    }

    /// Fold per-tier write results: `Success` when all succeeded, `Fail` when
    /// none did, `PartSuccess` otherwise. The last error seen is kept.
    pub(crate) fn merge_writes(results: impl IntoIterator<Item = CacheResult>) -> Self {
        let mut succeeded = 0usize;
        let mut total = 0usize;
        let mut error = None;
        for result in results {
            total += 1;
            if result.is_success() {
                succeeded += 1;
            } else if result.error.is_some() {
                error = result.error;
            }
        }
        let code = if succeeded == total {
            CacheResultCode::Success
        } else if succeeded == 0 {
            CacheResultCode::Fail
        } else {
            CacheResultCode::PartSuccess
        };
        Self { code, error }
    }

    /// Fold per-tier remove results. A tier reporting `NotExists` is not a
    /// failure; the aggregate is `NotExists` only if no tier held the key.
    pub(crate) fn merge_removes(results: impl IntoIterator<Item = CacheResult>) -> Self {
        let mut removed = false;
        let mut failed = 0usize;
        let mut total = 0usize;
        let mut error = None;
        for result in results {
            total += 1;
            match result.code {
                CacheResultCode::Success => removed = true,
                CacheResultCode::NotExists | CacheResultCode::Expired => {}
                _ => {
                    failed += 1;
                    if result.error.is_some() {
                        error = result.error;
                    }
                }
            }
        }
        let code = if failed == 0 {
            if removed {
                CacheResultCode::Success
            } else {
                CacheResultCode::NotExists
            }
        } else if failed == total {
            CacheResultCode::Fail
        } else {
            CacheResultCode::PartSuccess
        };
        Self { code, error }
    }
}

/// Result of a single-key read.
#[derive(Debug, Clone)]
pub struct CacheGetResult<V> {
    code: CacheResultCode,
    value: Option<V>,
    error: Option<Arc<CacheError>>,
}

impl<V> CacheGetResult<V> {
    /// A hit. `value == None` is a cached null.
    pub fn hit(value: Option<V>) -> Self {
        Self {
            code: CacheResultCode::Success,
            value,
            error: None,
        }
    }

    pub fn not_exists() -> Self {
        Self::miss(CacheResultCode::NotExists)
    }

    pub fn expired() -> Self {
        Self::miss(CacheResultCode::Expired)
    }

    pub fn fail(error: CacheError) -> Self {
        Self::failed(Arc::new(error))
    }

    pub(crate) fn failed(error: Arc<CacheError>) -> Self {
        Self {
            code: CacheResultCode::Fail,
            value: None,
            error: Some(error),
        }
    }

    fn miss(code: CacheResultCode) -> Self {
        Self {
            code,
            value: None,
            error: None,
        }
    }

    pub fn code(&self) -> CacheResultCode {
        self.code
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn error(&self) -> Option<&CacheError> {
        self.error.as_deref()
    }

    pub fn is_success(&self) -> bool {
        self.code == CacheResultCode::Success
    }

    /// `NotExists` and `Expired` are the same miss signal.
    pub fn is_miss(&self) -> bool {
        matches!(
            self.code,
            CacheResultCode::NotExists | CacheResultCode::Expired
        )
    }

    pub(crate) fn shared_error(&self) -> Option<Arc<CacheError>> {
        self.error.clone()
    }

    /// Map the carried value, keeping code and error.
    pub fn map<U>(self, f: impl FnOnce(V) -> Option<U>) -> CacheGetResult<U> {
        CacheGetResult {
            code: self.code,
            value: self.value.and_then(f),
            error: self.error,
        }
    }
}

/// Result of a batch read: one aggregate code plus one result per key.
#[derive(Debug, Clone)]
pub struct MultiGetResult<K, V> {
    code: CacheResultCode,
    values: HashMap<K, CacheGetResult<V>>,
}

impl<K: Hash + Eq, V> MultiGetResult<K, V> {
    /// Aggregate is `Success` unless a per-key lookup ended in `Fail`.
    pub fn from_values(values: HashMap<K, CacheGetResult<V>>) -> Self {
        let code = if values
            .values()
            .any(|r| r.code() == CacheResultCode::Fail)
        {
            CacheResultCode::Fail
        } else {
            CacheResultCode::Success
        };
        Self { code, values }
    }

    /// Every key failed with the same error.
    pub fn fail_all<'a>(keys: impl IntoIterator<Item = &'a K>, error: CacheError) -> Self
    where
        K: Clone + 'a,
    {
        let error = Arc::new(error);
        let values = keys
            .into_iter()
            .map(|k| (k.clone(), CacheGetResult::failed(Arc::clone(&error))))
            .collect();
        Self {
            code: CacheResultCode::Fail,
            values,
        }
    }

    pub fn code(&self) -> CacheResultCode {
        self.code
    }

    pub fn is_success(&self) -> bool {
        self.code == CacheResultCode::Success
    }

    pub fn values(&self) -> &HashMap<K, CacheGetResult<V>> {
        &self.values
    }

    pub fn get(&self, key: &K) -> Option<&CacheGetResult<V>> {
        self.values.get(key)
    }

    pub fn into_values(self) -> HashMap<K, CacheGetResult<V>> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_writes() {
        let all = CacheResult::merge_writes([CacheResult::success(), CacheResult::success()]);
        assert_eq!(all.code(), CacheResultCode::Success);

        let some = CacheResult::merge_writes([
            CacheResult::success(),
            CacheResult::fail(CacheError::InvalidTtl),
        ]);
        assert_eq!(some.code(), CacheResultCode::PartSuccess);
        assert!(matches!(some.error(), Some(CacheError::InvalidTtl)));

        let none = CacheResult::merge_writes([CacheResult::fail(CacheError::InvalidTtl)]);
        assert_eq!(none.code(), CacheResultCode::Fail);
    }

    #[test]
    fn test_merge_removes_tolerates_not_exists() {
        let removed =
            CacheResult::merge_removes([CacheResult::not_exists(), CacheResult::success()]);
        assert_eq!(removed.code(), CacheResultCode::Success);

        let absent =
            CacheResult::merge_removes([CacheResult::not_exists(), CacheResult::not_exists()]);
        assert_eq!(absent.code(), CacheResultCode::NotExists);

        let partial = CacheResult::merge_removes([
            CacheResult::success(),
            CacheResult::fail(CacheError::InvalidTtl),
        ]);
        assert_eq!(partial.code(), CacheResultCode::PartSuccess);
    }

    #[test]
    fn test_get_result_null_hit_is_success() {
        let hit: CacheGetResult<String> = CacheGetResult::hit(None);
        assert!(hit.is_success());
        assert!(hit.value().is_none());

        let miss: CacheGetResult<String> = CacheGetResult::expired();
        assert!(miss.is_miss());
        assert!(!miss.is_success());
    }

    #[test]
    fn test_multi_get_aggregate() {
        let mut values = HashMap::new();
        values.insert("a", CacheGetResult::hit(Some(1)));
        values.insert("b", CacheGetResult::not_exists());
        assert!(MultiGetResult::from_values(values.clone()).is_success());

        values.insert("c", CacheGetResult::fail(CacheError::InvalidTtl));
        assert_eq!(
            MultiGetResult::from_values(values).code(),
            CacheResultCode::Fail
        );
    }
}
