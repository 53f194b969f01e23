//! Cache configuration

use std::fmt::Display;
use std::time::Duration;

/// Engine-wide configuration for a multi-level cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name used in log lines
    pub name: String,
    /// TTL for writes that do not give one
    pub default_ttl: Duration,
    /// Whether compute-on-miss stores a loader's `None` by default
    pub cache_null_value: bool,
    /// Naming of lock entries, kept apart from application keys
    pub lock_key_scheme: LockKeyScheme,
    /// Default bound on waiting for another caller's in-flight load
    pub load_wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            default_ttl: Duration::from_secs(3600), // 1 hour
            cache_null_value: false,
            lock_key_scheme: LockKeyScheme::default(),
            load_wait_timeout: None,
        }
    }
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_cache_null_value(mut self, enabled: bool) -> Self {
        self.cache_null_value = enabled;
        self
    }

    pub fn with_lock_key_scheme(mut self, scheme: LockKeyScheme) -> Self {
        self.lock_key_scheme = scheme;
        self
    }

    pub fn with_load_wait_timeout(mut self, timeout: Duration) -> Self {
        self.load_wait_timeout = Some(timeout);
        self
    }
}

/// How lock entry keys are derived from the locked key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeyScheme {
    pub prefix: String,
    pub suffix: String,
}

impl Default for LockKeyScheme {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            suffix: "_#RL#".to_owned(),
        }
    }
}

impl LockKeyScheme {
    pub fn lock_key(&self, key: &impl Display) -> String {
        format!("{}{}{}", self.prefix, key, self.suffix)
    }
}

/// When a tier's entries expire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpirePolicy {
    /// TTL counts from the write
    #[default]
    AfterWrite,
    /// TTL restarts on every successful read
    AfterAccess,
}

/// Configuration for the in-process moka tier
#[derive(Debug, Clone)]
pub struct MokaTierConfig {
    /// Maximum number of entries
    pub max_capacity: u64,
    pub expire_policy: ExpirePolicy,
}

impl Default for MokaTierConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            expire_policy: ExpirePolicy::AfterWrite,
        }
    }
}

/// Configuration for the redis tier
#[derive(Debug, Clone, Default)]
pub struct RedisTierConfig {
    pub expire_policy: ExpirePolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_scheme() {
        assert_eq!(LockKeyScheme::default().lock_key(&"order:7"), "order:7_#RL#");

        let scheme = LockKeyScheme {
            prefix: "lock:".to_owned(),
            suffix: String::new(),
        };
        assert_eq!(scheme.lock_key(&42), "lock:42");
    }

    #[test]
    fn test_builder_setters() {
        let config = CacheConfig::new("orders")
            .with_default_ttl(Duration::from_secs(5))
            .with_cache_null_value(true)
            .with_load_wait_timeout(Duration::from_millis(250));
        assert_eq!(config.name, "orders");
        assert_eq!(config.default_ttl, Duration::from_secs(5));
        assert!(config.cache_null_value);
        assert_eq!(config.load_wait_timeout, Some(Duration::from_millis(250)));
    }
}
