//! L1 Cache - In-process Local Cache
//!
//! Bounded key/value store owned by one process. Never touches the network.
//!
//! # Design
//!
//! - Exact LRU: a recency index (`BTreeMap<tick, key>`) next to the entry map,
//!   both guarded by one mutex so the two can never disagree
//! - Expire-after-write, expire-after-access and an optional per-entry TTL,
//!   whichever elapses first
//! - Expired entries are dropped lazily on lookup and by [`LocalCache::cleanup_expired`]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::entry::{CacheEntry, CachedValue};
use super::stats::{CacheTier, StatsCollector};
use crate::config::LocalConfig;

struct Slot {
    entry: CacheEntry,
    last_access: Instant,
    tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.tick);
        Some(slot)
    }

    fn touch(&mut self, key: &str, now: Instant) {
        let tick = self.tick();
        if let Some(slot) = self.entries.get_mut(key) {
            self.recency.remove(&slot.tick);
            slot.tick = tick;
            slot.last_access = now;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn pop_lru(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }
}

/// L1 cache
pub struct LocalCache {
    inner: Mutex<Inner>,
    config: LocalConfig,
    stats: Option<Arc<StatsCollector>>,
}

impl LocalCache {
    /// Create a new local cache
    pub fn new(config: LocalConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            stats: None,
        }
    }

    /// Record capacity and expiry evictions into `stats`
    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Configuration in effect
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn is_expired(&self, slot: &Slot, now: Instant) -> bool {
        if slot.entry.is_expired_at(now) {
            return true;
        }
        let eaw = self.config.expire_after_write;
        if !eaw.is_zero() && now.duration_since(slot.entry.inserted_at) >= eaw {
            return true;
        }
        let eaa = self.config.expire_after_access;
        !eaa.is_zero() && now.duration_since(slot.last_access) >= eaa
    }

    fn record_evictions(&self, n: usize) {
        if n > 0 {
            if let Some(stats) = &self.stats {
                stats.record_evictions(CacheTier::L1, n as u64);
            }
        }
    }

    /// Look up a key, refreshing its recency and access time
    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            Some(slot) => self.is_expired(slot, now),
            None => return None,
        };
        if expired {
            inner.remove(key);
            drop(inner);
            self.record_evictions(1);
            return None;
        }

        inner.touch(key, now);
        inner.entries.get(key).map(|slot| slot.entry.value.clone())
    }

    /// Look up a key without refreshing recency
    pub fn peek(&self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .filter(|slot| !self.is_expired(slot, now))
            .map(|slot| slot.entry.value.clone())
    }

    /// Insert or replace a key; evicts the least recently used entries
    /// beyond `max_size`
    pub fn put(&self, key: impl Into<String>, value: CachedValue, ttl: Option<Duration>) {
        let key = key.into();
        let now = Instant::now();
        let evicted = {
            let mut inner = self.inner.lock();
            inner.remove(&key);

            let tick = inner.tick();
            inner.recency.insert(tick, key.clone());
            inner.entries.insert(
                key.clone(),
                Slot {
                    entry: CacheEntry::new(key, value, ttl),
                    last_access: now,
                    tick,
                },
            );

            let mut evicted = 0;
            while inner.entries.len() > self.config.max_size {
                if inner.pop_lru().is_none() {
                    break;
                }
                evicted += 1;
            }
            evicted
        };
        self.record_evictions(evicted);
    }

    /// Remove one key
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove a set of keys, returning how many were present
    pub fn invalidate_many<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> usize {
        let mut inner = self.inner.lock();
        keys.into_iter()
            .filter(|key| inner.remove(key).is_some())
            .count()
    }

    /// Remove every key accepted by `predicate` (linear in the entry count)
    pub fn invalidate_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut inner = self.inner.lock();
        let matched: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in &matched {
            inner.remove(key);
        }
        matched.len()
    }

    /// Remove everything
    pub fn invalidate_all(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.entries.len();
        inner.entries.clear();
        inner.recency.clear();
        n
    }

    /// Re-arm a key's TTL from now; false when the key is absent
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(slot) => {
                slot.entry.inserted_at = now;
                slot.entry.ttl = Some(ttl);
                true
            }
            None => false,
        }
    }

    /// Live keys
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .filter(|slot| !self.is_expired(slot, now))
            .map(|slot| slot.entry.key.clone())
            .collect()
    }

    /// Number of stored entries, including not-yet-collected expired ones
    pub fn size(&self) -> u64 {
        self.inner.lock().entries.len() as u64
    }

    /// Drop all expired entries
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut inner = self.inner.lock();
            let expired: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, slot)| self.is_expired(slot, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                inner.remove(key);
            }
            expired.len()
        };
        self.record_evictions(removed);
        removed
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(max_size: usize) -> LocalConfig {
        LocalConfig {
            max_size,
            expire_after_write: Duration::ZERO,
            expire_after_access: Duration::ZERO,
        }
    }

    fn value(n: i64) -> CachedValue {
        CachedValue::Value(json!(n))
    }

    #[test]
    fn test_put_get() {
        let cache = LocalCache::new(config(10));
        cache.put("a", value(1), None);
        assert_eq!(cache.get("a"), Some(value(1)));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.size(), 1);

        cache.put("a", value(2), None);
        assert_eq!(cache.get("a"), Some(value(2)));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_null_marker_is_a_hit() {
        let cache = LocalCache::new(config(10));
        cache.put("missing", CachedValue::NullMarker, None);
        assert_eq!(cache.get("missing"), Some(CachedValue::NullMarker));
    }

    #[test]
    fn test_lru_eviction() {
        let stats = Arc::new(StatsCollector::new());
        let cache = LocalCache::new(config(2)).with_stats(stats.clone());
        cache.put("a", value(1), None);
        cache.put("b", value(2), None);

        // touch "a" so "b" becomes least recently used
        assert!(cache.get("a").is_some());
        cache.put("c", value(3), None);

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.size(), 2);
        assert_eq!(stats.snapshot("t", 0, 0).l1.evictions, 1);
    }

    #[test]
    fn test_peek_does_not_refresh_recency() {
        let cache = LocalCache::new(config(2));
        cache.put("a", value(1), None);
        cache.put("b", value(2), None);
        assert!(cache.peek("a").is_some());
        cache.put("c", value(3), None);
        assert!(cache.peek("a").is_none());
    }

    #[test]
    fn test_expire_after_write() {
        let cache = LocalCache::new(LocalConfig {
            max_size: 10,
            expire_after_write: Duration::from_millis(30),
            expire_after_access: Duration::ZERO,
        });
        cache.put("a", value(1), None);
        assert!(cache.get("a").is_some());
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_expire_after_access() {
        let cache = LocalCache::new(LocalConfig {
            max_size: 10,
            expire_after_write: Duration::ZERO,
            expire_after_access: Duration::from_millis(80),
        });
        cache.put("a", value(1), None);
        cache.put("b", value(2), None);
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(40));
            assert!(cache.get("a").is_some());
        }
        // "b" was never read after the write
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_per_entry_ttl_and_expire() {
        let cache = LocalCache::new(config(10));
        cache.put("a", value(1), Some(Duration::from_millis(30)));
        assert!(cache.expire("a", Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("a").is_some());

        assert!(!cache.expire("missing", Duration::from_secs(1)));
        assert!(cache.expire("a", Duration::ZERO));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = LocalCache::new(config(10));
        cache.put("short", value(1), Some(Duration::from_millis(10)));
        cache.put("long", value(2), None);
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(cache.keys(), vec!["long".to_string()]);
        assert_eq!(cache.size(), 2);
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_invalidate_variants() {
        let cache = LocalCache::new(config(10));
        for key in ["user:1", "user:2", "order:1", "order:2"] {
            cache.put(key, value(0), None);
        }

        assert!(cache.invalidate("user:1"));
        assert!(!cache.invalidate("user:1"));
        assert_eq!(cache.invalidate_many(["user:2", "nope"]), 1);
        assert_eq!(cache.invalidate_matching(|k| k.starts_with("order:")), 2);
        assert_eq!(cache.size(), 0);

        cache.put("x", value(0), None);
        assert_eq!(cache.invalidate_all(), 1);
        assert!(cache.keys().is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(LocalCache::new(config(100)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("k{}", (t * 500 + i) % 150);
                        cache.put(key.clone(), value(i), None);
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.size() <= 100);
    }
}
