//! Cache Core
//!
//! One instance per cache name. Composes L1, L2, the distributed lock and
//! the event channel into the read/write protocol:
//!
//! ```text
//! get(key, loader)
//!   L1 hit ──────────────────────────────────────────────► value
//!   L2 hit ──► backfill L1 ──────────────────────────────► value
//!   miss ──► lock(cache:key) ──► re-check L1/L2 ──► hit ──► value
//!                                      │
//!                                      └─ miss ──► loader ──► L2 ──► L1 ──► unlock ──► PUT event
//! ```
//!
//! # L2 failure policy
//!
//! - reads fail open: an L1 hit never touches L2, an L2 error after an L1
//!   miss is returned
//! - writes fail closed: the L2 error is returned, L1 is left untouched and
//!   no event is published
//! - evictions always drop the L1 copy, then return the L2 error without
//!   publishing

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::entry::CachedValue;
use super::local::LocalCache;
use super::pattern::KeyPattern;
use super::stats::{CacheTier, LatencyTracker, StatsCollector, StatsSnapshot};
use super::ttl::TtlPolicy;
use crate::config::CacheConfig;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{DistributedLock, EventChannel, LockGuard, NodeIdentity, RemoteStore};
use crate::error::{Error, Result};

/// Shared infrastructure a node talks to
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn RemoteStore>,
    pub lock: Arc<dyn DistributedLock>,
    pub channel: Arc<dyn EventChannel>,
}

/// Outcome of a warm-up run
#[derive(Debug, Clone, serde::Serialize)]
pub struct WarmupReport {
    pub cache: String,
    /// Entries copied into L1
    pub processed: usize,
    /// Chunks that failed
    pub errors: usize,
    pub duration: Duration,
}

enum Loaded {
    /// Found by the re-check inside the lock
    Cached(CachedValue),
    /// Produced by the loader and written to both tiers
    Fresh(CachedValue, Duration),
    /// Loader found nothing and null caching is off
    Uncached,
}

/// Two-tier cache for one cache name
pub struct CacheCore {
    name: String,
    config: CacheConfig,
    node: NodeIdentity,
    /// `None` when this cache does not publish events
    topic: Option<String>,
    local: LocalCache,
    store: Arc<dyn RemoteStore>,
    lock: Arc<dyn DistributedLock>,
    channel: Arc<dyn EventChannel>,
    ttl_policy: TtlPolicy,
    stats: Arc<StatsCollector>,
}

impl CacheCore {
    /// Create a cache; events are published on `topic` when one is given
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        node: NodeIdentity,
        backends: Backends,
        topic: Option<String>,
    ) -> Self {
        let stats = Arc::new(StatsCollector::new());
        let local = LocalCache::new(config.local.clone()).with_stats(stats.clone());
        Self {
            name: name.into(),
            ttl_policy: TtlPolicy::from_config(&config.protection),
            config,
            node,
            topic,
            local,
            store: backends.store,
            lock: backends.lock,
            channel: backends.channel,
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.node.as_str()
    }

    /// The L1 tier
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    pub fn stats_collector(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    /// Whether misses are guarded by the distributed lock
    pub fn lock_enabled(&self) -> bool {
        self.config.protection.lock_enabled
    }

    fn lock_name(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }

    /// L1 TTL for a value; null markers live no longer than `null_value_ttl`
    pub(crate) fn local_ttl(&self, value: &CachedValue) -> Option<Duration> {
        value
            .is_null_marker()
            .then_some(self.config.protection.null_value_ttl)
    }

    /// Value to store for a loaded or written result, with its L2 TTL.
    /// `None` when an absent value must not be cached.
    fn prepare(&self, value: Option<Value>) -> Option<(CachedValue, Duration)> {
        match value {
            Some(value) => Some((
                CachedValue::Value(value),
                self.ttl_policy.compute(self.config.remote.time_to_live),
            )),
            None if self.config.protection.null_value_enabled => Some((
                CachedValue::NullMarker,
                self.config.protection.null_value_ttl,
            )),
            None => None,
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a key, filling it from `loader` on a miss in both tiers.
    ///
    /// `Ok(None)` means the key does not exist (possibly a cached null
    /// marker). With lock protection at most one loader runs per key across
    /// all nodes; a caller that cannot get the lock in `lock_wait_time`
    /// receives `Error::LockTimeout`.
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Value>>>,
    {
        self.stats.record_request();
        if let Some(value) = self.local.get(key) {
            self.stats.record_hit(CacheTier::L1);
            debug!(cache = %self.name, key = %key, "L1 hit");
            return Ok(value.into_value());
        }
        self.stats.record_miss(CacheTier::L1);

        if let Some(value) = self.store.get(&self.name, key).await? {
            self.stats.record_hit(CacheTier::L2);
            debug!(cache = %self.name, key = %key, "L2 hit");
            self.local.put(key, value.clone(), self.local_ttl(&value));
            return Ok(value.into_value());
        }
        self.stats.record_miss(CacheTier::L2);

        self.load(key, loader).await
    }

    async fn load<F, Fut>(&self, key: &str, loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Value>>>,
    {
        let guard = if self.lock_enabled() {
            let lock_name = self.lock_name(key);
            let wait = self.config.protection.lock_wait_time;
            let lease = self
                .lock
                .try_lock(&lock_name, wait, self.config.protection.lock_lease_time)
                .await?;
            match lease {
                Some(lease) => Some(LockGuard::new(self.lock.clone(), lease)),
                None => {
                    warn!(cache = %self.name, key = %key, ?wait, "Timed out waiting for load lock");
                    return Err(Error::LockTimeout { lock_name, wait });
                }
            }
        } else {
            None
        };

        let double_check = guard.is_some();
        let loaded = self.load_and_fill(key, loader, double_check).await;

        if let Some(guard) = guard {
            let lock_name = guard.name().to_string();
            if let Err(e) = guard.release().await {
                warn!(cache = %self.name, lock = %lock_name, error = %e, "Failed to release load lock");
            }
        }

        match loaded? {
            Loaded::Cached(value) => Ok(value.into_value()),
            Loaded::Fresh(value, ttl) => {
                self.publish(CacheEvent::put(
                    &self.name,
                    key,
                    value.clone(),
                    ttl,
                    self.node.as_str(),
                ))
                .await;
                Ok(value.into_value())
            }
            Loaded::Uncached => Ok(None),
        }
    }

    async fn load_and_fill<F, Fut>(&self, key: &str, loader: F, double_check: bool) -> Result<Loaded>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Value>>>,
    {
        if double_check {
            // Another caller may have filled the key while we waited
            if let Some(value) = self.local.peek(key) {
                self.stats.record_hit(CacheTier::L1);
                return Ok(Loaded::Cached(value));
            }
            if let Some(value) = self.store.get(&self.name, key).await? {
                self.stats.record_hit(CacheTier::L2);
                self.local.put(key, value.clone(), self.local_ttl(&value));
                return Ok(Loaded::Cached(value));
            }
        }

        let tracker = LatencyTracker::start();
        let result = loader().await;
        self.stats.record_load(tracker.elapsed(), result.is_ok());
        let loaded = result.map_err(Error::Loader)?;
        debug!(cache = %self.name, key = %key, found = loaded.is_some(), elapsed = ?tracker.elapsed(), "Loaded value");

        let Some((value, ttl)) = self.prepare(loaded) else {
            return Ok(Loaded::Uncached);
        };

        self.store.put(&self.name, key, value.clone(), ttl).await?;
        self.stats.record_put(CacheTier::L2);
        self.local.put(key, value.clone(), self.local_ttl(&value));
        self.stats.record_put(CacheTier::L1);

        Ok(Loaded::Fresh(value, ttl))
    }

    /// Typed [`CacheCore::get`]
    pub async fn get_as<T, F, Fut>(&self, key: &str, loader: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let value = self
            .get(key, move || async move {
                let loaded: anyhow::Result<Option<Value>> = match loader().await {
                    Ok(Some(typed)) => serde_json::to_value(typed)
                        .map(Some)
                        .map_err(anyhow::Error::from),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e),
                };
                loaded
            })
            .await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Read many keys without a loader; absent keys are left out of the map
    pub async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, Option<Value>>> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut missing = Vec::new();

        for key in keys {
            self.stats.record_request();
            match self.local.get(key) {
                Some(value) => {
                    self.stats.record_hit(CacheTier::L1);
                    found.insert(key.clone(), value.into_value());
                }
                None => {
                    self.stats.record_miss(CacheTier::L1);
                    missing.push(key.clone());
                }
            }
        }

        for (chunk_index, chunk) in missing.chunks(self.config.batch.max_size).enumerate() {
            let remote = self
                .with_batch_timeout("get_all", self.store.get_all(&self.name, chunk))
                .await
                .map_err(|source| Error::BatchPartialFailure {
                    operation: "get_all",
                    chunk_index,
                    committed_chunks: chunk_index,
                    source: Box::new(source),
                })?;

            for key in chunk {
                match remote.get(key) {
                    Some(value) => {
                        self.stats.record_hit(CacheTier::L2);
                        self.local.put(key.clone(), value.clone(), self.local_ttl(value));
                        found.insert(key.clone(), value.clone().into_value());
                    }
                    None => self.stats.record_miss(CacheTier::L2),
                }
            }
        }

        Ok(found)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a key through L2 then L1 and announce it.
    ///
    /// `None` is cached as a null marker when null caching is enabled and
    /// dropped otherwise.
    pub async fn put(&self, key: &str, value: Option<Value>) -> Result<()> {
        let Some((value, ttl)) = self.prepare(value) else {
            debug!(cache = %self.name, key = %key, "Dropping absent value, null caching disabled");
            return Ok(());
        };

        self.store.put(&self.name, key, value.clone(), ttl).await?;
        self.stats.record_put(CacheTier::L2);
        self.local.put(key, value.clone(), self.local_ttl(&value));
        self.stats.record_put(CacheTier::L1);

        self.publish(CacheEvent::put(&self.name, key, value, ttl, self.node.as_str()))
            .await;
        Ok(())
    }

    /// Typed [`CacheCore::put`]
    pub async fn put_as<T: Serialize>(&self, key: &str, value: Option<&T>) -> Result<()> {
        let value = value.map(serde_json::to_value).transpose()?;
        self.put(key, value).await
    }

    /// Write many entries in chunks of `batch.max_size`, one L2 round trip
    /// and one event per chunk. Earlier chunks stay committed when a later
    /// one fails.
    pub async fn put_all<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let entries: Vec<(String, CachedValue)> = entries
            .into_iter()
            .map(|(key, value)| (key, CachedValue::Value(value)))
            .collect();

        for (chunk_index, chunk) in entries.chunks(self.config.batch.max_size).enumerate() {
            let ttl = self.ttl_policy.compute(self.config.remote.time_to_live);
            self.with_batch_timeout("put_all", self.store.put_all(&self.name, chunk, ttl))
                .await
                .map_err(|source| {
                    warn!(cache = %self.name, chunk_index, error = %source, "Batch put chunk failed");
                    Error::BatchPartialFailure {
                        operation: "put_all",
                        chunk_index,
                        committed_chunks: chunk_index,
                        source: Box::new(source),
                    }
                })?;
            self.stats.record_puts(CacheTier::L2, chunk.len() as u64);

            for (key, value) in chunk {
                self.local.put(key.clone(), value.clone(), None);
            }
            self.stats.record_puts(CacheTier::L1, chunk.len() as u64);

            let event_entries = chunk.iter().cloned().collect();
            self.publish(CacheEvent::batch_put(
                &self.name,
                event_entries,
                ttl,
                self.node.as_str(),
            ))
            .await;
        }

        debug!(cache = %self.name, count = entries.len(), "Batch put complete");
        Ok(())
    }

    /// Change a key's TTL in both tiers; false when L2 does not hold the key
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let existed = self.store.expire(&self.name, key, ttl).await?;
        self.local.expire(key, ttl);
        if existed {
            self.publish(CacheEvent::expire(&self.name, key, ttl, self.node.as_str()))
                .await;
        }
        Ok(existed)
    }

    // =========================================================================
    // Evictions
    // =========================================================================

    /// Remove a key from L2 then L1 and announce it
    pub async fn evict(&self, key: &str) -> Result<()> {
        let remote = self.store.remove(&self.name, key).await;
        if self.local.invalidate(key) {
            self.stats.record_eviction(CacheTier::L1);
        }
        if remote? {
            self.stats.record_eviction(CacheTier::L2);
        }

        self.publish(CacheEvent::remove(&self.name, key, self.node.as_str()))
            .await;
        Ok(())
    }

    /// Remove many keys in chunks of `batch.max_size`
    pub async fn evict_all(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;

        for (chunk_index, chunk) in keys.chunks(self.config.batch.max_size).enumerate() {
            let remote = self
                .with_batch_timeout("evict_all", self.store.remove_all(&self.name, chunk))
                .await;
            let local = self.local.invalidate_many(chunk.iter().map(String::as_str));
            self.stats.record_evictions(CacheTier::L1, local as u64);

            let remote = remote.map_err(|source| {
                warn!(cache = %self.name, chunk_index, error = %source, "Batch evict chunk failed");
                Error::BatchPartialFailure {
                    operation: "evict_all",
                    chunk_index,
                    committed_chunks: chunk_index,
                    source: Box::new(source),
                }
            })?;
            self.stats.record_evictions(CacheTier::L2, remote);
            removed += remote;

            self.publish(CacheEvent::batch_remove(
                &self.name,
                chunk.to_vec(),
                self.node.as_str(),
            ))
            .await;
        }

        Ok(removed)
    }

    /// Remove every key matching a glob (`*`, `?`) from both tiers.
    ///
    /// Scans the full key set of each tier. An empty pattern is a no-op.
    pub async fn evict_by_pattern(&self, pattern: &str) -> Result<u64> {
        if pattern.is_empty() {
            return Ok(0);
        }
        let matcher = KeyPattern::new(pattern)?;

        let local = self.local.invalidate_matching(|key| matcher.matches(key));
        self.stats.record_evictions(CacheTier::L1, local as u64);

        let matched: Vec<String> = self
            .store
            .keys(&self.name)
            .await?
            .into_iter()
            .filter(|key| matcher.matches(key))
            .collect();

        let mut removed = 0;
        for chunk in matched.chunks(self.config.batch.max_size) {
            removed += self
                .with_batch_timeout("evict_by_pattern", self.store.remove_all(&self.name, chunk))
                .await?;
        }
        self.stats.record_evictions(CacheTier::L2, removed);

        debug!(cache = %self.name, pattern = %pattern, local, remote = removed, "Evicted by pattern");
        self.publish(CacheEvent::remove_pattern(
            &self.name,
            pattern,
            self.node.as_str(),
        ))
        .await;
        Ok(removed)
    }

    /// Empty both tiers for this cache name
    pub async fn clear(&self) -> Result<()> {
        let remote = self.store.clear(&self.name).await;
        let local = self.local.invalidate_all();
        self.stats.record_evictions(CacheTier::L1, local as u64);
        self.stats.record_evictions(CacheTier::L2, remote?);

        info!(cache = %self.name, "Cache cleared");
        self.publish(CacheEvent::clear(&self.name, self.node.as_str()))
            .await;
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Union of L2 and L1 keys, sorted
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.store.keys(&self.name).await?.into_iter().collect();
        keys.extend(self.local.keys());
        Ok(keys.into_iter().collect())
    }

    /// Estimated entry count: L2 size plus L1 size
    pub async fn size(&self) -> Result<u64> {
        Ok(self.store.size(&self.name).await? + self.local.size())
    }

    /// Point-in-time stats; an unreachable L2 reports size 0
    pub async fn stats(&self) -> StatsSnapshot {
        let l2_size = match self.store.size(&self.name).await {
            Ok(size) => size,
            Err(e) => {
                debug!(cache = %self.name, error = %e, "L2 size unavailable for stats");
                0
            }
        };
        self.stats.snapshot(&self.name, self.local.size(), l2_size)
    }

    /// Copy entries currently in L2 into L1, up to L1 capacity
    pub async fn warm_from_remote(&self) -> Result<WarmupReport> {
        let started = Instant::now();
        let mut keys = self.store.keys(&self.name).await?;
        keys.truncate(self.config.local.max_size);

        let mut processed = 0;
        let mut errors = 0;
        for chunk in keys.chunks(self.config.batch.max_size) {
            match self
                .with_batch_timeout("warm", self.store.get_all(&self.name, chunk))
                .await
            {
                Ok(values) => {
                    for (key, value) in values {
                        let ttl = self.local_ttl(&value);
                        self.local.put(key, value, ttl);
                        processed += 1;
                    }
                }
                Err(e) => {
                    warn!(cache = %self.name, error = %e, "Warm-up chunk failed");
                    errors += 1;
                }
            }
        }

        let report = WarmupReport {
            cache: self.name.clone(),
            processed,
            errors,
            duration: started.elapsed(),
        };
        info!(
            cache = %report.cache,
            processed = report.processed,
            errors = report.errors,
            duration = ?report.duration,
            "Cache warm-up complete"
        );
        Ok(report)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn with_batch_timeout<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timeout = self.config.batch.timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::RemoteStoreUnavailable(format!(
                "{} chunk timed out after {:?}",
                operation, timeout
            ))),
        }
    }

    /// Fire-and-forget publish; failures are logged only
    async fn publish(&self, event: CacheEvent) {
        let Some(topic) = self.topic.as_deref() else {
            return;
        };
        match self.channel.publish(topic, &event).await {
            Ok(()) => debug!(
                cache = %self.name,
                event_type = %event.event_type,
                event_id = %event.event_id,
                "Published cache event"
            ),
            Err(e) => warn!(
                cache = %self.name,
                event_type = %event.event_type,
                event_id = %event.event_id,
                error = %e,
                "Failed to publish cache event"
            ),
        }
    }
}

impl std::fmt::Debug for CacheCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCore")
            .field("name", &self.name)
            .field("node", &self.node)
            .field("topic", &self.topic)
            .field("store", &self.store.name())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
