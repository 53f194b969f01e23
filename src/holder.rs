//! Value envelope carrying expiry metadata
//!
//! Every tier stores a [`CacheValueHolder`] rather than the bare value, so that
//! expiry is tracked the same way whether or not the backend expires entries
//! on its own. The holder is also the unit a codec serializes for remote tiers.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall-clock time in epoch milliseconds.
///
/// Envelopes travel between processes through shared tiers, so expiry is
/// expressed against the wall clock rather than a process-local `Instant`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Envelopes keep whole milliseconds, so anything shorter would be stored
/// already expired.
pub(crate) fn is_valid_ttl(ttl: Duration) -> bool {
    ttl.as_millis() > 0
}

/// A cached value together with its creation time, TTL and derived expiry.
///
/// `value == None` is a cached null: a legitimate entry, distinct from the key
/// being absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheValueHolder<V> {
    value: Option<V>,
    create_time: u64,
    init_ttl_millis: u64,
    expire_time: u64,
}

impl<V> CacheValueHolder<V> {
    /// Build an envelope written at `create_time` (epoch millis) living for `ttl`.
    pub fn new(value: Option<V>, create_time: u64, ttl: Duration) -> Self {
        let init_ttl_millis = ttl.as_millis() as u64;
        Self {
            value,
            create_time,
            init_ttl_millis,
            expire_time: create_time.saturating_add(init_ttl_millis),
        }
    }

    /// Build an envelope written now.
    pub fn fresh(value: Option<V>, ttl: Duration) -> Self {
        Self::new(value, now_millis(), ttl)
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<V> {
        self.value
    }

    pub fn create_time(&self) -> u64 {
        self.create_time
    }

    pub fn init_ttl(&self) -> Duration {
        Duration::from_millis(self.init_ttl_millis)
    }

    pub fn expire_time(&self) -> u64 {
        self.expire_time
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expire_time
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining(&self, now: u64) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            Some(Duration::from_millis(self.expire_time - now))
        }
    }

    /// Copy of this envelope with its expiry pushed to `now + ttl`, for tiers
    /// using expire-after-access.
    pub fn refreshed(&self, now: u64) -> Self
    where
        V: Clone,
    {
        Self {
            value: self.value.clone(),
            create_time: self.create_time,
            init_ttl_millis: self.init_ttl_millis,
            expire_time: now.saturating_add(self.init_ttl_millis),
        }
    }

    /// Whether both envelopes come from the same write. Expiry is ignored
    /// because sliding refreshes move it.
    pub fn same_write(&self, other: &Self) -> bool
    where
        V: PartialEq,
    {
        self.create_time == other.create_time
            && self.init_ttl_millis == other.init_ttl_millis
            && self.value == other.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expire_time_is_derived() {
        let holder = CacheValueHolder::new(Some("v"), 1_000, Duration::from_millis(500));
        assert_eq!(holder.expire_time(), 1_500);
        assert_eq!(holder.init_ttl(), Duration::from_millis(500));
        assert!(!holder.is_expired(1_499));
        assert!(holder.is_expired(1_500));
    }

    #[test]
    fn test_remaining() {
        let holder = CacheValueHolder::new(Some(1), 1_000, Duration::from_millis(500));
        assert_eq!(holder.remaining(1_200), Some(Duration::from_millis(300)));
        assert_eq!(holder.remaining(1_500), None);
    }

    #[test]
    fn test_refreshed_slides_expiry_only() {
        let holder = CacheValueHolder::new(Some(1), 1_000, Duration::from_millis(500));
        let refreshed = holder.refreshed(1_400);
        assert_eq!(refreshed.create_time(), 1_000);
        assert_eq!(refreshed.expire_time(), 1_900);
        assert!(refreshed.same_write(&holder));
    }

    #[test]
    fn test_null_value_is_carried() {
        let holder: CacheValueHolder<String> =
            CacheValueHolder::new(None, 1_000, Duration::from_secs(1));
        assert!(holder.value().is_none());
        assert!(!holder.is_expired(1_001));
    }

    #[test]
    fn test_same_write_distinguishes_values() {
        let a = CacheValueHolder::new(Some("a"), 1_000, Duration::from_secs(1));
        let b = CacheValueHolder::new(Some("b"), 1_000, Duration::from_secs(1));
        assert!(!a.same_write(&b));
    }

    #[test]
    fn test_sub_millisecond_ttl_is_invalid() {
        assert!(!is_valid_ttl(Duration::ZERO));
        assert!(!is_valid_ttl(Duration::from_micros(900)));
        assert!(is_valid_ttl(Duration::from_millis(1)));

        let holder = CacheValueHolder::new(Some(1), 1_000, Duration::from_micros(900));
        assert!(holder.is_expired(1_000));
    }
}
