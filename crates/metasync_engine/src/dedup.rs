//! Suppression of change notifications that were already published.
//!
//! The cache is advisory. A miss, an expired entry or a cache failure only
//! costs a redundant write; it never affects correctness because sink writes
//! are idempotent by document id.

use crate::version::VersionToken;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default lifetime of a dedup record, in seconds.
pub const DEFAULT_CACHE_TTL: u64 = 60;

/// Shared key/value store recording the last published version of an object.
pub trait TimestampCache: Send + Sync {
    /// Returns the cached version token for `key`.
    fn get(&self, key: &str) -> Result<Option<String>, String>;

    /// Stores `value` under `key` for `ttl_secs` seconds.
    fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), String>;
}

impl<C: TimestampCache + ?Sized> TimestampCache for std::sync::Arc<C> {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), String> {
        (**self).set(key, value, ttl_secs)
    }
}

/// In-process [`TimestampCache`] with per-entry expiry.
///
/// Expired entries are dropped on lookup and on every write. A TTL too large
/// to represent never expires.
#[derive(Debug, Default)]
pub struct MemoryTimestampCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

fn is_live(expires: Option<Instant>, now: Instant) -> bool {
    expires.is_none_or(|at| at > now)
}

impl MemoryTimestampCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|(_, expires)| is_live(*expires, now))
            .count()
    }

    /// Returns true if no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl TimestampCache for MemoryTimestampCache {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if is_live(*expires, Instant::now()) => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), String> {
        let now = Instant::now();
        let expires = now.checked_add(Duration::from_secs(ttl_secs));
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, expires)| is_live(*expires, now));
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }
}

/// Decides whether a row still needs publishing.
pub struct DedupFilter<'a> {
    cache: &'a dyn TimestampCache,
    ttl_secs: u64,
}

impl<'a> DedupFilter<'a> {
    /// Creates a filter over `cache` recording entries for `ttl_secs`.
    pub fn new(cache: &'a dyn TimestampCache, ttl_secs: u64) -> Self {
        Self { cache, ttl_secs }
    }

    /// Returns false if the cache already holds a version whose metadata
    /// time is at least the row's.
    ///
    /// Cache failures and undecodable cached values count as misses.
    pub fn should_publish(&self, key: &str, version: &VersionToken) -> bool {
        let cached = match self.cache.get(key) {
            Ok(Some(cached)) => cached,
            Ok(None) => return true,
            Err(e) => {
                warn!(key, error = %e, "dedup cache lookup failed");
                return true;
            }
        };
        match cached.parse::<VersionToken>() {
            Ok(cached) if cached.meta_time() >= version.meta_time() => {
                debug!(key, "skipping already published row");
                false
            }
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "ignoring undecodable dedup record");
                true
            }
        }
    }

    /// Records that `created_at` was published for `key`.
    pub fn record(&self, key: &str, created_at: &str) {
        if let Err(e) = self.cache.set(key, created_at, self.ttl_secs) {
            warn!(key, error = %e, "dedup cache update failed");
        }
    }
}

/// Builds the dedup identity key of an object.
pub fn identity_key(destination: &str, account: &str, container: &str, object: &str) -> String {
    format!("{destination}/{account}/{container}/{object}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    struct BrokenCache;

    impl TimestampCache for BrokenCache {
        fn get(&self, _key: &str) -> Result<Option<String>, String> {
            Err("connection refused".into())
        }

        fn set(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<(), String> {
            Err("connection refused".into())
        }
    }

    fn token(s: &str) -> VersionToken {
        s.parse().unwrap()
    }

    #[test]
    fn memory_cache_expires() {
        let cache = MemoryTimestampCache::new();
        cache.set("k", "v", 60).unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(cache.len(), 1);

        cache.set("k", "v", 0).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn huge_ttl_never_expires() {
        let cache = MemoryTimestampCache::new();
        cache.set("k", "v", u64::MAX).unwrap();
        assert_eq!(cache.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn writes_prune_expired_entries() {
        let cache = MemoryTimestampCache::new();
        cache.set("stale-1", "v", 0).unwrap();
        cache.set("stale-2", "v", 0).unwrap();
        cache.set("live", "v", 60).unwrap();

        let stored: Vec<String> = cache.entries.lock().keys().cloned().collect();
        assert_eq!(stored, vec!["live".to_string()]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn suppresses_rows_not_newer_than_cached() {
        let cache = MemoryTimestampCache::new();
        let filter = DedupFilter::new(&cache, DEFAULT_CACHE_TTL);
        let key = identity_key("cluster", "a", "c", "o");

        assert!(filter.should_publish(&key, &token("1000000.00000")));
        filter.record(&key, "1000000.00000+0+64");

        assert!(!filter.should_publish(&key, &token("1000000.00000")));
        assert!(!filter.should_publish(&key, &token("1000000.00000+0+64")));
        assert!(filter.should_publish(&key, &token("1000000.00000+0+65")));
        assert!(filter.should_publish(&key, &token("1000001.00000")));
    }

    #[test]
    fn only_meta_time_is_compared() {
        let cache = MemoryTimestampCache::new();
        let filter = DedupFilter::new(&cache, DEFAULT_CACHE_TTL);
        // same metadata time reached through different content times
        filter.record("k", "1000000.00000+64");
        assert!(!filter.should_publish("k", &token("1000000.00000+32+32")));
    }

    #[traced_test]
    #[test]
    fn cache_failures_are_swallowed() {
        let cache = BrokenCache;
        let filter = DedupFilter::new(&cache, DEFAULT_CACHE_TTL);
        assert!(filter.should_publish("k", &token("1")));
        filter.record("k", "1");
        assert!(logs_contain("dedup cache lookup failed"));
        assert!(logs_contain("dedup cache update failed"));
    }

    #[test]
    fn garbage_records_are_misses() {
        let cache = MemoryTimestampCache::new();
        cache.set("k", "not a token", 60).unwrap();
        let filter = DedupFilter::new(&cache, DEFAULT_CACHE_TTL);
        assert!(filter.should_publish("k", &token("1")));
    }
}
