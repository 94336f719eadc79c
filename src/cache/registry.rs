//! Cache Registry
//!
//! Owns one [`CacheCore`] per cache name, created on first use from the
//! settings' per-cache config (or the default config). Also the entry point
//! for the cache API keyed by cache name, for starting event sync and for
//! the periodic stats reporter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::core::{Backends, CacheCore, WarmupReport};
use super::stats::StatsSnapshot;
use crate::config::CacheSettings;
use crate::domain::ports::NodeIdentity;
use crate::error::Result;
use crate::sync::{SyncAgent, SyncHandle};

/// All caches of one node
pub struct CacheRegistry {
    settings: CacheSettings,
    node: NodeIdentity,
    backends: Backends,
    caches: DashMap<String, Arc<CacheCore>>,
}

impl CacheRegistry {
    /// Create a registry; the node id comes from the settings or is generated
    pub fn new(settings: CacheSettings, backends: Backends) -> Self {
        let node = NodeIdentity::from_config(settings.node_id.as_deref());
        info!(
            node_id = %node,
            sync = settings.sync.enabled,
            topic = %settings.sync.topic,
            "Cache registry created"
        );
        Self {
            settings,
            node,
            backends,
            caches: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.node.as_str()
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The cache called `name`, created on first use
    pub fn cache(&self, name: &str) -> Arc<CacheCore> {
        if let Some(cache) = self.caches.get(name) {
            return cache.clone();
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self.settings.config_for(name).clone();
                let publishes = self.settings.sync.enabled && config.sync_enabled;
                info!(
                    cache = %name,
                    max_size = config.local.max_size,
                    ttl = ?config.remote.time_to_live,
                    lock = config.protection.lock_enabled,
                    publishes,
                    "Creating cache"
                );
                Arc::new(CacheCore::new(
                    name,
                    config,
                    self.node.clone(),
                    self.backends.clone(),
                    publishes.then(|| self.settings.sync.topic.clone()),
                ))
            })
            .clone()
    }

    /// The cache called `name` if it was already created
    pub fn existing(&self, name: &str) -> Option<Arc<CacheCore>> {
        self.caches.get(name).map(|cache| cache.clone())
    }

    /// Names of created caches, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<CacheCore>> {
        let mut caches: Vec<Arc<CacheCore>> =
            self.caches.iter().map(|e| e.value().clone()).collect();
        caches.sort_by(|a, b| a.name().cmp(b.name()));
        caches
    }

    // =========================================================================
    // Cache API by name
    // =========================================================================

    pub async fn get<F, Fut>(&self, cache: &str, key: &str, loader: F) -> Result<Option<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<Value>>>,
    {
        self.cache(cache).get(key, loader).await
    }

    pub async fn put(&self, cache: &str, key: &str, value: Option<Value>) -> Result<()> {
        self.cache(cache).put(key, value).await
    }

    pub async fn evict(&self, cache: &str, key: &str) -> Result<()> {
        self.cache(cache).evict(key).await
    }

    pub async fn evict_by_pattern(&self, cache: &str, pattern: &str) -> Result<u64> {
        self.cache(cache).evict_by_pattern(pattern).await
    }

    pub async fn clear(&self, cache: &str) -> Result<()> {
        self.cache(cache).clear().await
    }

    pub async fn get_all(
        &self,
        cache: &str,
        keys: &[String],
    ) -> Result<HashMap<String, Option<Value>>> {
        self.cache(cache).get_all(keys).await
    }

    pub async fn put_all<I>(&self, cache: &str, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.cache(cache).put_all(entries).await
    }

    pub async fn evict_all(&self, cache: &str, keys: &[String]) -> Result<u64> {
        self.cache(cache).evict_all(keys).await
    }

    pub async fn stats(&self, cache: &str) -> StatsSnapshot {
        self.cache(cache).stats().await
    }

    // =========================================================================
    // Whole-node operations
    // =========================================================================

    /// Stats of every created cache, sorted by name
    pub async fn stats_all(&self) -> Vec<StatsSnapshot> {
        let mut snapshots = Vec::new();
        for cache in self.all() {
            snapshots.push(cache.stats().await);
        }
        snapshots
    }

    /// Clear every created cache; returns the first failure after trying all
    pub async fn clear_all(&self) -> Result<()> {
        let mut first_error = None;
        for cache in self.all() {
            if let Err(e) = cache.clear().await {
                warn!(cache = %cache.name(), error = %e, "Failed to clear cache");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Warm every created cache from L2; caches that fail are skipped
    pub async fn warm_all(&self) -> Vec<WarmupReport> {
        let mut reports = Vec::new();
        for cache in self.all() {
            match cache.warm_from_remote().await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(cache = %cache.name(), error = %e, "Cache warm-up failed"),
            }
        }
        reports
    }

    /// Run [`warm_all`](Self::warm_all) when `warmup.warm_on_start` is set,
    /// bounded by `warmup.timeout`. `None` when disabled or timed out.
    pub async fn warm_on_start(&self) -> Option<Vec<WarmupReport>> {
        let warmup = &self.settings.warmup;
        if !warmup.warm_on_start {
            return None;
        }
        match tokio::time::timeout(warmup.timeout, self.warm_all()).await {
            Ok(reports) => {
                let processed: usize = reports.iter().map(|r| r.processed).sum();
                info!(caches = reports.len(), processed, "Startup warm-up complete");
                Some(reports)
            }
            Err(_) => {
                warn!(timeout = ?warmup.timeout, "Startup warm-up timed out");
                None
            }
        }
    }

    /// Zero the stats of one created cache; false when it does not exist
    pub fn reset_stats(&self, name: &str) -> bool {
        let Some(cache) = self.existing(name) else {
            return false;
        };
        cache.stats_collector().reset();
        info!(cache = %name, "Cache stats reset");
        true
    }

    /// Zero the stats of every created cache; returns their names, sorted
    pub fn reset_all_stats(&self) -> Vec<String> {
        let caches = self.all();
        for cache in &caches {
            cache.stats_collector().reset();
        }
        info!(caches = caches.len(), "All cache stats reset");
        caches.iter().map(|c| c.name().to_string()).collect()
    }

    /// Subscribe to the event topic and start applying remote events.
    /// `None` when sync is disabled.
    pub async fn start_sync(self: &Arc<Self>) -> Result<Option<SyncHandle>> {
        if !self.settings.sync.enabled {
            info!(node_id = %self.node, "Cache sync disabled");
            return Ok(None);
        }
        let events = self
            .backends
            .channel
            .subscribe(&self.settings.sync.topic)
            .await?;
        let agent = Arc::new(SyncAgent::new(self.clone(), &self.settings.dedup));
        info!(node_id = %self.node, topic = %self.settings.sync.topic, "Cache sync started");
        Ok(Some(SyncHandle::spawn(agent, events)))
    }

    /// Log every cache's stats each `stats.log_interval` until `cancel`
    /// fires. `None` when reporting is disabled.
    pub fn spawn_stats_reporter(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.settings.stats.enabled {
            return None;
        }
        let registry = self.clone();
        let period = self.settings.stats.log_interval.max(Duration::from_millis(1));
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => registry.report_stats().await,
                }
            }
        }))
    }

    async fn report_stats(&self) {
        for cache in self.all() {
            let expired = cache.local().cleanup_expired();
            let s = cache.stats().await;
            info!(
                cache = %s.cache_name,
                requests = s.requests,
                hit_ratio = %format!("{:.2}%", s.hit_ratio * 100.0),
                l1_hits = s.l1.hits,
                l1_misses = s.l1.misses,
                l1_size = s.l1.estimated_size,
                l2_hits = s.l2.hits,
                l2_misses = s.l2.misses,
                l2_size = s.l2.estimated_size,
                loads = s.loads,
                load_failures = s.load_failures,
                avg_load = ?s.average_load_penalty,
                expired,
                "Cache stats"
            );
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::config::CacheConfig;
    use crate::domain::ports::RemoteStore;
    use serde_json::json;

    fn registry(cluster: &InMemoryCluster, settings: CacheSettings) -> Arc<CacheRegistry> {
        Arc::new(CacheRegistry::new(settings, cluster.backends()))
    }

    #[test]
    fn test_node_identity() {
        let cluster = InMemoryCluster::new();
        let named = registry(
            &cluster,
            CacheSettings {
                node_id: Some("node-a".into()),
                ..CacheSettings::default()
            },
        );
        assert_eq!(named.node_id(), "node-a");

        let a = registry(&cluster, CacheSettings::default());
        let b = registry(&cluster, CacheSettings::default());
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn test_cache_created_once_with_override() {
        let cluster = InMemoryCluster::new();
        let mut settings = CacheSettings::default();
        let mut users = CacheConfig::default();
        users.local.max_size = 5;
        settings.caches.insert("users".into(), users);
        let registry = registry(&cluster, settings);

        let first = registry.cache("users");
        let second = registry.cache("users");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.config().local.max_size, 5);
        assert_eq!(registry.cache("orders").config().local.max_size, 1000);

        assert_eq!(registry.names(), vec!["orders".to_string(), "users".to_string()]);
        assert!(registry.existing("sessions").is_none());
    }

    #[tokio::test]
    async fn test_api_by_name() {
        let cluster = InMemoryCluster::new();
        let registry = registry(&cluster, CacheSettings::default());

        registry.put("users", "1", Some(json!("a"))).await.unwrap();
        registry
            .put_all("orders", vec![("o1".to_string(), json!(1))])
            .await
            .unwrap();

        let value = registry
            .get("users", "1", || async { Ok(None) })
            .await
            .unwrap();
        assert_eq!(value, Some(json!("a")));

        let stats = registry.stats_all().await;
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].cache_name, "orders");
        assert_eq!(stats[1].l1.hits, 1);

        registry.clear_all().await.unwrap();
        assert_eq!(cluster.store.size("users").await.unwrap(), 0);
        assert_eq!(cluster.store.size("orders").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_warm_all() {
        let cluster = InMemoryCluster::new();
        let writer = registry(&cluster, CacheSettings::default());
        writer.put("users", "1", Some(json!(1))).await.unwrap();
        writer.put("users", "2", Some(json!(2))).await.unwrap();

        let reader = registry(&cluster, CacheSettings::default());
        reader.cache("users");
        let reports = reader.warm_all().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].processed, 2);
        assert_eq!(reader.cache("users").local().size(), 2);
    }

    #[tokio::test]
    async fn test_warm_on_start() {
        let cluster = InMemoryCluster::new();
        let writer = registry(&cluster, CacheSettings::default());
        writer.put("users", "1", Some(json!(1))).await.unwrap();

        let idle = registry(&cluster, CacheSettings::default());
        idle.cache("users");
        assert!(idle.warm_on_start().await.is_none());
        assert_eq!(idle.cache("users").local().size(), 0);

        let mut settings = CacheSettings::default();
        settings.warmup.warm_on_start = true;
        let reader = registry(&cluster, settings);
        reader.cache("users");
        let reports = reader.warm_on_start().await.unwrap();
        assert_eq!(reports[0].processed, 1);
        assert_eq!(reader.cache("users").local().size(), 1);
    }

    #[tokio::test]
    async fn test_warm_on_start_times_out() {
        let cluster = InMemoryCluster::new();
        let mut settings = CacheSettings::default();
        settings.warmup.warm_on_start = true;
        settings.warmup.timeout = Duration::from_millis(20);
        let registry = registry(&cluster, settings);
        registry.put("users", "1", Some(json!(1))).await.unwrap();
        registry.cache("users").local().invalidate_all();

        cluster.store.set_latency(Duration::from_millis(200));
        assert!(registry.warm_on_start().await.is_none());
        assert_eq!(registry.cache("users").local().size(), 0);
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let cluster = InMemoryCluster::new();
        let registry = registry(&cluster, CacheSettings::default());
        registry.put("users", "1", Some(json!(1))).await.unwrap();
        registry.put("orders", "1", Some(json!(1))).await.unwrap();
        for cache in ["users", "orders"] {
            registry
                .get(cache, "1", || async { Ok(None) })
                .await
                .unwrap();
            registry
                .get(cache, "2", || async { Ok(Some(json!(2))) })
                .await
                .unwrap();
        }

        assert!(!registry.reset_stats("sessions"));
        assert!(registry.existing("sessions").is_none());

        assert!(registry.reset_stats("users"));
        let users = registry.stats("users").await;
        assert_eq!(users.requests, 0);
        assert_eq!(users.l1.hits, 0);
        assert_eq!(users.l1.misses, 0);
        assert_eq!(users.l2.puts, 0);
        assert_eq!(users.loads, 0);
        // sizes are live, not counters
        assert_eq!(users.l1.estimated_size, 2);
        assert_eq!(registry.stats("orders").await.loads, 1);

        assert_eq!(
            registry.reset_all_stats(),
            vec!["orders".to_string(), "users".to_string()]
        );
        let orders = registry.stats("orders").await;
        assert_eq!(orders.requests, 0);
        assert_eq!(orders.loads, 0);
        assert_eq!(orders.l1.puts, 0);
    }

    #[tokio::test]
    async fn test_sync_disabled() {
        let cluster = InMemoryCluster::new();
        let mut settings = CacheSettings::default();
        settings.sync.enabled = false;
        let registry = registry(&cluster, settings);

        assert!(registry.start_sync().await.unwrap().is_none());
        registry.put("users", "1", Some(json!(1))).await.unwrap();
        assert_eq!(cluster.channel.published(), 0);
    }

    #[tokio::test]
    async fn test_stats_reporter_stops_on_cancel() {
        let cluster = InMemoryCluster::new();
        let mut settings = CacheSettings::default();
        settings.stats.log_interval = Duration::from_millis(10);
        let registry = registry(&cluster, settings);
        registry.cache("users");

        let cancel = CancellationToken::new();
        let reporter = registry.spawn_stats_reporter(cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), reporter)
            .await
            .unwrap()
            .unwrap();
    }
}
