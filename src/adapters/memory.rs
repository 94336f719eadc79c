//! In-memory Adapters
//!
//! Process-local implementations of the three ports. Handles are cheap to
//! clone behind an `Arc`; every node built from the same handles behaves as
//! one member of a cluster sharing L2, the lock service and the pub/sub bus.
//! Used by the tests and by `meshcache simulate`.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, warn};

use crate::cache::core::Backends;
use crate::cache::entry::CachedValue;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{DistributedLock, EventChannel, LockLease, RemoteStore};
use crate::error::{Error, Result};

/// Default per-topic buffer of the in-memory channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Remote Store
// =============================================================================

#[derive(Debug, Clone)]
struct StoredValue {
    value: CachedValue,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: CachedValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: (!ttl.is_zero()).then(|| Instant::now() + ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Shared in-memory L2 store with per-key TTL
pub struct InMemoryRemoteStore {
    /// cache name -> key -> value
    storage: DashMap<String, DashMap<String, StoredValue>>,
    available: AtomicBool,
    /// Remaining batch writes before failing; negative means unlimited
    batch_write_budget: AtomicI64,
    /// Added to every call, in milliseconds
    latency_ms: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self {
            storage: DashMap::new(),
            available: AtomicBool::new(true),
            batch_write_budget: AtomicI64::new(-1),
            latency_ms: AtomicU64::new(0),
        }
    }
}

impl InMemoryRemoteStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Allow `n` more `put_all`/`remove_all` calls, then fail the rest
    pub fn limit_batch_writes(&self, n: usize) {
        self.batch_write_budget.store(n as i64, Ordering::SeqCst);
    }

    /// Simulate a slow L2: every call sleeps `latency` first
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check_available(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::RemoteStoreUnavailable("in-memory store offline".into()))
        }
    }

    async fn take_batch_write(&self) -> Result<()> {
        self.check_available().await?;
        let previous = self
            .batch_write_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |budget| match budget {
                b if b < 0 => Some(b),
                0 => None,
                b => Some(b - 1),
            });
        previous.map(|_| ()).map_err(|_| {
            Error::RemoteStoreUnavailable("in-memory store rejected batch write".into())
        })
    }

    fn live(&self, cache: &str, key: &str) -> Option<CachedValue> {
        let bucket = self.storage.get(cache)?;
        let now = Instant::now();
        let stored = bucket.get(key)?;
        if stored.is_live(now) {
            return Some(stored.value.clone());
        }
        drop(stored);
        bucket.remove_if(key, |_, v| !v.is_live(now));
        None
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CachedValue>> {
        self.check_available().await?;
        Ok(self.live(cache, key))
    }

    async fn put(&self, cache: &str, key: &str, value: CachedValue, ttl: Duration) -> Result<()> {
        self.check_available().await?;
        self.storage
            .entry(cache.to_string())
            .or_default()
            .insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn remove(&self, cache: &str, key: &str) -> Result<bool> {
        self.check_available().await?;
        let now = Instant::now();
        Ok(self
            .storage
            .get(cache)
            .and_then(|bucket| bucket.remove(key))
            .is_some_and(|(_, v)| v.is_live(now)))
    }

    async fn clear(&self, cache: &str) -> Result<u64> {
        self.check_available().await?;
        Ok(self
            .storage
            .remove(cache)
            .map_or(0, |(_, bucket)| bucket.len() as u64))
    }

    async fn get_all(&self, cache: &str, keys: &[String]) -> Result<HashMap<String, CachedValue>> {
        self.check_available().await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.live(cache, key).map(|v| (key.clone(), v)))
            .collect())
    }

    async fn put_all(
        &self,
        cache: &str,
        entries: &[(String, CachedValue)],
        ttl: Duration,
    ) -> Result<()> {
        self.take_batch_write().await?;
        let bucket = self.storage.entry(cache.to_string()).or_default();
        for (key, value) in entries {
            bucket.insert(key.clone(), StoredValue::new(value.clone(), ttl));
        }
        Ok(())
    }

    async fn remove_all(&self, cache: &str, keys: &[String]) -> Result<u64> {
        self.take_batch_write().await?;
        let Some(bucket) = self.storage.get(cache) else {
            return Ok(0);
        };
        Ok(keys.iter().filter(|key| bucket.remove(*key).is_some()).count() as u64)
    }

    async fn keys(&self, cache: &str) -> Result<Vec<String>> {
        self.check_available().await?;
        let now = Instant::now();
        Ok(self
            .storage
            .get(cache)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|e| e.value().is_live(now))
                    .map(|e| e.key().clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn size(&self, cache: &str) -> Result<u64> {
        self.check_available().await?;
        let now = Instant::now();
        Ok(self.storage.get(cache).map_or(0, |bucket| {
            bucket.iter().filter(|e| e.value().is_live(now)).count() as u64
        }))
    }

    async fn expire(&self, cache: &str, key: &str, ttl: Duration) -> Result<bool> {
        self.check_available().await?;
        let now = Instant::now();
        let Some(bucket) = self.storage.get(cache) else {
            return Ok(false);
        };
        let Some(mut stored) = bucket.get_mut(key) else {
            return Ok(false);
        };
        if !stored.is_live(now) {
            return Ok(false);
        }
        stored.expires_at = Some(now + ttl);
        Ok(true)
    }
}

// =============================================================================
// Distributed Lock
// =============================================================================

#[derive(Debug)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// Shared in-memory lock service with lease expiry
#[derive(Default)]
pub struct InMemoryLock {
    held: DashMap<String, HeldLock>,
    released: Notify,
    acquisitions: AtomicU64,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently held by anyone
    pub fn is_locked(&self, name: &str) -> bool {
        let now = Instant::now();
        self.held.get(name).is_some_and(|h| h.expires_at > now)
    }

    /// Successful acquisitions so far
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Take the lock if free; otherwise how long until the holder's lease ends
    fn try_acquire(&self, lease: &LockLease, lease_time: Duration) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let held = HeldLock {
            token: lease.token.clone(),
            expires_at: now + lease_time,
        };
        match self.held.entry(lease.name.clone()) {
            Entry::Occupied(mut occupied) => {
                let expires_at = occupied.get().expires_at;
                if expires_at > now {
                    return Err(expires_at - now);
                }
                debug!(lock = %lease.name, "Taking over expired lock lease");
                occupied.insert(held);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(held);
            }
        }
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_lock(
        &self,
        name: &str,
        wait: Duration,
        lease_time: Duration,
    ) -> Result<Option<LockLease>> {
        let lease = LockLease::new(name);
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking so a release in between is not missed
            let mut released = pin!(self.released.notified());
            released.as_mut().enable();

            let until_expiry = match self.try_acquire(&lease, lease_time) {
                Ok(()) => return Ok(Some(lease)),
                Err(until_expiry) => until_expiry,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(until_expiry);
            let _ = tokio::time::timeout(nap, released).await;
        }
    }

    async fn unlock(&self, lease: &LockLease) -> Result<()> {
        if self
            .held
            .remove_if(&lease.name, |_, held| held.token == lease.token)
            .is_some()
        {
            self.released.notify_waiters();
        }
        Ok(())
    }
}

// =============================================================================
// Event Channel
// =============================================================================

/// Shared in-memory pub/sub bus; events cross it JSON-encoded
pub struct InMemoryEventChannel {
    topics: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
    available: AtomicBool,
    published: AtomicU64,
}

impl Default for InMemoryEventChannel {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryEventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel buffering up to `capacity` frames per slow subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Simulate a broken bus: publishes fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Frames published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Publish a raw frame, bypassing the codec
    pub fn publish_raw(&self, topic: &str, frame: impl Into<String>) {
        let _ = self.sender(topic).send(frame.into());
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, topic: &str, event: &CacheEvent) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::EventPublish("in-memory channel offline".into()));
        }
        let frame = event.encode()?;
        // No subscribers is not an error for pub/sub
        let _ = self.sender(topic).send(frame);
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, CacheEvent>> {
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();

        Ok(stream::unfold((receiver, topic), |(mut receiver, topic)| async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => match CacheEvent::decode(&frame) {
                        Ok(event) => return Some((event, (receiver, topic))),
                        Err(e) => {
                            error!(topic = %topic, error = %e, "Dropping undecodable cache event");
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Event subscriber lagged, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// Store, lock and channel shared by every simulated node
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    pub store: Arc<InMemoryRemoteStore>,
    pub lock: Arc<InMemoryLock>,
    pub channel: Arc<InMemoryEventChannel>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port handles for one more node of this cluster
    pub fn backends(&self) -> Backends {
        Backends {
            store: self.store.clone(),
            lock: self.lock.clone(),
            channel: self.channel.clone(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn value(n: i64) -> CachedValue {
        CachedValue::Value(json!(n))
    }

    #[tokio::test]
    async fn test_store_namespaces_by_cache() {
        let store = InMemoryRemoteStore::new();
        let ttl = Duration::from_secs(60);
        store.put("users", "1", value(1), ttl).await.unwrap();
        store.put("orders", "1", value(2), ttl).await.unwrap();

        assert_eq!(store.get("users", "1").await.unwrap(), Some(value(1)));
        assert_eq!(store.get("orders", "1").await.unwrap(), Some(value(2)));
        assert_eq!(store.clear("users").await.unwrap(), 1);
        assert_eq!(store.get("users", "1").await.unwrap(), None);
        assert_eq!(store.size("orders").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_ttl_and_expire() {
        let store = InMemoryRemoteStore::new();
        store
            .put("t", "short", value(1), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .put("t", "kept", value(2), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(store.expire("t", "kept", Duration::from_secs(60)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("t", "short").await.unwrap(), None);
        assert_eq!(store.get("t", "kept").await.unwrap(), Some(value(2)));
        assert_eq!(store.keys("t").await.unwrap(), vec!["kept".to_string()]);
        assert!(!store.expire("t", "short", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_store_batches() {
        let store = InMemoryRemoteStore::new();
        let entries = vec![("a".to_string(), value(1)), ("b".to_string(), value(2))];
        store.put_all("t", &entries, Duration::from_secs(60)).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let found = store.get_all("t", &keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["b"], value(2));

        assert_eq!(store.remove_all("t", &keys).await.unwrap(), 2);
        assert_eq!(store.size("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_injection() {
        let store = InMemoryRemoteStore::new();
        store.set_available(false);
        assert_matches!(
            store.get("t", "a").await,
            Err(Error::RemoteStoreUnavailable(_))
        );
        store.set_available(true);

        store.limit_batch_writes(1);
        let entries = vec![("a".to_string(), value(1))];
        let ttl = Duration::from_secs(60);
        assert!(store.put_all("t", &entries, ttl).await.is_ok());
        assert_matches!(
            store.put_all("t", &entries, ttl).await,
            Err(Error::RemoteStoreUnavailable(_))
        );
        // single-key writes are unaffected
        assert!(store.put("t", "b", value(2), ttl).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion() {
        let lock = InMemoryLock::new();
        let wait = Duration::from_millis(20);
        let lease = Duration::from_secs(10);

        let held = lock.try_lock("users:1", wait, lease).await.unwrap().unwrap();
        assert!(lock.is_locked("users:1"));
        assert!(lock.try_lock("users:1", wait, lease).await.unwrap().is_none());
        // other names are independent
        assert!(lock.try_lock("users:2", wait, lease).await.unwrap().is_some());

        lock.unlock(&held).await.unwrap();
        // idempotent
        lock.unlock(&held).await.unwrap();
        assert!(lock.try_lock("users:1", wait, lease).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_waiter_wakes_on_release() {
        let lock = Arc::new(InMemoryLock::new());
        let held = lock
            .try_lock("k", Duration::ZERO, Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.try_lock("k", Duration::from_secs(5), Duration::from_secs(10))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.unlock(&held).await.unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test]
    async fn test_lock_lease_expiry() {
        let lock = InMemoryLock::new();
        let stale = lock
            .try_lock("k", Duration::ZERO, Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();

        // holder "crashed"; the lease runs out while we wait
        let taken = lock
            .try_lock("k", Duration::from_secs(1), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(taken.token, stale.token);

        // the stale holder cannot release the new holder's lock
        lock.unlock(&stale).await.unwrap();
        assert!(lock.is_locked("k"));
    }

    #[tokio::test]
    async fn test_channel_fan_out() {
        let channel = InMemoryEventChannel::new();
        let mut first = channel.subscribe("cache:events").await.unwrap();
        let mut second = channel.subscribe("cache:events").await.unwrap();
        let mut other = channel.subscribe("other").await.unwrap();

        let event = CacheEvent::remove("users", "42", "node-a");
        channel.publish("cache:events", &event).await.unwrap();

        assert_eq!(first.next().await.unwrap(), event);
        assert_eq!(second.next().await.unwrap(), event);
        let nothing = tokio::time::timeout(Duration::from_millis(20), other.next()).await;
        assert!(nothing.is_err());
        assert_eq!(channel.published(), 1);
    }

    #[tokio::test]
    async fn test_channel_skips_garbage_frames() {
        let channel = InMemoryEventChannel::new();
        let mut events = channel.subscribe("t").await.unwrap();

        channel.publish_raw("t", "{not json");
        let event = CacheEvent::clear("users", "node-a");
        channel.publish("t", &event).await.unwrap();

        assert_eq!(events.next().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_channel_publish_failure() {
        let channel = InMemoryEventChannel::new();
        channel.set_available(false);
        let event = CacheEvent::clear("users", "node-a");
        assert_matches!(channel.publish("t", &event).await, Err(Error::EventPublish(_)));
    }
}
