//! Response caching with TTL and LRU eviction
//!
//! Entries are sharded by backend: each backend's entries live behind their
//! own lock, so cache traffic for one backend never waits on another. The
//! capacity bound and the LRU order are global. Every access stamps the entry
//! with a value from a shared monotonic clock, and eviction removes the entry
//! with the smallest stamp across all shards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::CacheConfig;

/// Cache key: owning backend plus a digest of endpoint, method and params
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    backend: String,
    digest: String,
}

impl CacheKey {
    /// Build a key from the request coordinates.
    ///
    /// The digest is the SHA-256 of the method, endpoint and canonical JSON
    /// params, so equivalent objects with differently ordered keys collide.
    #[must_use]
    pub fn build(backend: &str, endpoint: &str, method: &str, params: Option<&Value>) -> Self {
        let canonical = params
            .map(|p| serde_json::to_string(p).unwrap_or_default())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(method.to_ascii_uppercase().as_bytes());
        hasher.update(b"\n");
        hasher.update(endpoint.as_bytes());
        hasher.update(b"\n");
        hasher.update(canonical.as_bytes());
        Self {
            backend: backend.to_string(),
            digest: hex::encode(hasher.finalize()),
        }
    }

    /// Backend this key belongs to
    #[must_use]
    pub fn backend(&self) -> &str {
        &self.backend
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.backend, self.digest)
    }
}

/// A cached response with TTL metadata
struct CachedResponse {
    value: Value,
    stored_at: Instant,
    ttl: Duration,
    /// LRU stamp
    stamp: u64,
}

impl CachedResponse {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) > self.ttl
    }
}

/// Entries of one backend, with their LRU order
#[derive(Default)]
struct Shard {
    entries: HashMap<String, CachedResponse>,
    /// stamp -> digest, oldest first
    order: BTreeMap<u64, String>,
}

impl Shard {
    fn remove(&mut self, digest: &str) -> bool {
        if let Some(entry) = self.entries.remove(digest) {
            self.order.remove(&entry.stamp);
            true
        } else {
            false
        }
    }

    fn oldest_stamp(&self) -> Option<u64> {
        self.order.keys().next().copied()
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Thread-safe response cache with TTL expiry and LRU eviction
pub struct ResponseCache {
    capacity: usize,
    default_ttl: Duration,
    shards: DashMap<String, Arc<Mutex<Shard>>>,
    len: AtomicUsize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl ResponseCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            default_ttl,
            shards: DashMap::new(),
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Create from configuration
    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, config.default_ttl)
    }

    /// TTL applied when a call does not override it
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a cached response if it exists and hasn't expired.
    ///
    /// Expired entries are evicted on the spot.
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let Some(shard) = self.shards.get(&key.backend).map(|s| Arc::clone(s.value())) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let now = Instant::now();
        let mut shard = shard.lock();

        let expired = match shard.entries.get(&key.digest) {
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            shard.remove(&key.digest);
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let stamp = self.tick();
        let Shard { entries, order } = &mut *shard;
        let entry = entries.get_mut(&key.digest)?;
        order.remove(&entry.stamp);
        entry.stamp = stamp;
        order.insert(stamp, key.digest.clone());

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Store a value, evicting least-recently-used entries beyond capacity
    pub fn put(&self, key: &CacheKey, value: Value, ttl: Duration) {
        let shard = Arc::clone(
            self.shards
                .entry(key.backend.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Shard::default())))
                .value(),
        );

        {
            let mut shard = shard.lock();
            let stamp = self.tick();
            let replaced = shard.remove(&key.digest);
            shard.entries.insert(
                key.digest.clone(),
                CachedResponse {
                    value,
                    stored_at: Instant::now(),
                    ttl,
                    stamp,
                },
            );
            shard.order.insert(stamp, key.digest.clone());
            if !replaced {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }

        while self.len.load(Ordering::Relaxed) > self.capacity {
            if !self.evict_lru() {
                break;
            }
        }
    }

    /// Remove the globally least-recently-used entry
    fn evict_lru(&self) -> bool {
        let shards: Vec<Arc<Mutex<Shard>>> =
            self.shards.iter().map(|s| Arc::clone(s.value())).collect();

        let victim = shards
            .iter()
            .filter_map(|s| s.lock().oldest_stamp().map(|stamp| (stamp, s)))
            .min_by_key(|(stamp, _)| *stamp);

        let Some((stamp, shard)) = victim else {
            return false;
        };

        let mut shard = shard.lock();
        // Another caller may have touched or evicted it since the scan
        if shard.oldest_stamp() != Some(stamp) {
            return true;
        }
        if let Some(digest) = shard.order.get(&stamp).cloned() {
            shard.remove(&digest);
            self.len.fetch_sub(1, Ordering::Relaxed);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop every entry of one backend.
    ///
    /// The shard itself stays in place: callers may hold a handle to it, and
    /// entries they insert must stay reachable and counted.
    pub fn invalidate_backend(&self, backend_id: &str) {
        if let Some(shard) = self.shards.get(backend_id).map(|s| Arc::clone(s.value())) {
            self.clear_shard(&shard);
        }
    }

    fn clear_shard(&self, shard: &Mutex<Shard>) {
        let mut shard = shard.lock();
        let removed = shard.entries.len();
        shard.entries.clear();
        shard.order.clear();
        // Under the shard lock, like every other change to `len`
        self.len.fetch_sub(removed, Ordering::Relaxed);
    }

    /// Evict expired entries (background maintenance)
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let shards: Vec<Arc<Mutex<Shard>>> =
            self.shards.iter().map(|s| Arc::clone(s.value())).collect();

        let mut count = 0;
        for shard in shards {
            let mut shard = shard.lock();
            let expired: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            let mut removed = 0;
            for digest in expired {
                if shard.remove(&digest) {
                    removed += 1;
                }
            }
            self.len.fetch_sub(removed, Ordering::Relaxed);
            count += removed;
        }

        if count > 0 {
            self.stats.evictions.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Clear all cached entries
    pub fn clear(&self) {
        let shards: Vec<Arc<Mutex<Shard>>> =
            self.shards.iter().map(|s| Arc::clone(s.value())).collect();
        for shard in shards {
            self.clear_shard(&shard);
        }
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// True when the cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStatsSnapshot {
            size: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    /// Current number of entries
    pub size: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions (TTL and LRU)
    pub evictions: u64,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(backend: &str, endpoint: &str) -> CacheKey {
        CacheKey::build(backend, endpoint, "GET", None)
    }

    #[test]
    fn test_put_then_get() {
        let cache = ResponseCache::new(10, Duration::from_secs(30));
        let k = key("memory", "/items");
        cache.put(&k, json!({"items": [1, 2]}), Duration::from_secs(60));

        assert_eq!(cache.get(&k), Some(json!({"items": [1, 2]})));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_miss_on_unknown_key() {
        let cache = ResponseCache::new(10, Duration::from_secs(30));
        assert_eq!(cache.get(&key("memory", "/nothing")), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResponseCache::new(10, Duration::from_secs(30));
        let k = key("memory", "/items");
        cache.put(&k, json!(1), Duration::from_millis(10));

        assert_eq!(cache.get(&k), Some(json!(1)));
        std::thread::sleep(Duration::from_millis(15));

        assert_eq!(cache.get(&k), None);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_evicts_least_recently_used() {
        let cache = ResponseCache::new(2, Duration::from_secs(30));
        let a = key("memory", "/a");
        let b = key("search", "/b");
        let c = key("memory", "/c");

        cache.put(&a, json!("a"), Duration::from_secs(60));
        cache.put(&b, json!("b"), Duration::from_secs(60));
        // Touch a so b becomes the LRU entry, across shards
        assert!(cache.get(&a).is_some());
        cache.put(&c, json!("c"), Duration::from_secs(60));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&b), None);
        assert_eq!(cache.get(&a), Some(json!("a")));
        assert_eq!(cache.get(&c), Some(json!("c")));
    }

    #[test]
    fn test_most_recent_insert_survives() {
        let cache = ResponseCache::new(1, Duration::from_secs(30));
        let a = key("memory", "/a");
        let b = key("memory", "/b");
        cache.put(&a, json!("a"), Duration::from_secs(60));
        cache.put(&b, json!("b"), Duration::from_secs(60));

        assert_eq!(cache.get(&b), Some(json!("b")));
        assert_eq!(cache.get(&a), None);
    }

    #[test]
    fn test_replace_does_not_grow() {
        let cache = ResponseCache::new(5, Duration::from_secs(30));
        let k = key("memory", "/a");
        cache.put(&k, json!(1), Duration::from_secs(60));
        cache.put(&k, json!(2), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&k), Some(json!(2)));
    }

    #[test]
    fn test_key_is_deterministic_over_param_order() {
        let a = CacheKey::build("b", "/q", "get", Some(&json!({"x": 1, "y": 2})));
        let b = CacheKey::build("b", "/q", "GET", Some(&json!({"y": 2, "x": 1})));
        assert_eq!(a, b);
        assert!(a.to_string().starts_with("b:"));
        assert_eq!(a.to_string().len(), "b:".len() + 64);

        let other_method = CacheKey::build("b", "/q", "POST", Some(&json!({"x": 1, "y": 2})));
        assert_ne!(a, other_method);
    }

    #[test]
    fn test_invalidate_backend() {
        let cache = ResponseCache::new(10, Duration::from_secs(30));
        cache.put(&key("a", "/1"), json!(1), Duration::from_secs(60));
        cache.put(&key("a", "/2"), json!(2), Duration::from_secs(60));
        cache.put(&key("b", "/1"), json!(3), Duration::from_secs(60));

        cache.invalidate_backend("a");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a", "/1")), None);
        assert_eq!(cache.get(&key("b", "/1")), Some(json!(3)));
    }

    #[test]
    fn test_evict_expired_sweep() {
        let cache = ResponseCache::new(10, Duration::from_secs(30));
        cache.put(&key("a", "/short"), json!(1), Duration::from_millis(1));
        cache.put(&key("a", "/long"), json!(2), Duration::from_secs(60));

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a", "/long")), Some(json!(2)));
    }

    #[test]
    fn test_hit_rate_and_clear() {
        let cache = ResponseCache::new(10, Duration::from_secs(30));
        cache.put(&key("a", "/1"), json!(1), Duration::from_secs(60));
        cache.get(&key("a", "/1"));
        cache.get(&key("a", "/1"));
        cache.get(&key("a", "/missing"));

        let stats = cache.stats();
        assert!((stats.hit_rate - 0.666).abs() < 0.01);
        assert_eq!(stats.capacity, 10);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_during_concurrent_puts_keeps_len_exact() {
        let cache = Arc::new(ResponseCache::new(100_000, Duration::from_secs(30)));

        std::thread::scope(|scope| {
            for t in 0..6 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..500 {
                        cache.put(&key("a", &format!("/{t}/{i}")), json!(i), Duration::from_secs(60));
                    }
                });
            }
            for _ in 0..200 {
                cache.invalidate_backend("a");
                std::thread::yield_now();
            }
        });

        let stored: usize = cache.shards.iter().map(|s| s.value().lock().entries.len()).sum();
        assert_eq!(cache.len(), stored);

        cache.invalidate_backend("a");
        assert!(cache.is_empty());
        cache.put(&key("a", "/after"), json!(1), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
    }
}
