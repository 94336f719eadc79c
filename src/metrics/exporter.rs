//! Cache Metrics Exporter
//!
//! Mirrors [`StatsSnapshot`]s and sync agent counters into a private
//! Prometheus registry. Stats are pulled on [`refresh`](CacheMetricsExporter::refresh),
//! so the cache path never touches Prometheus types.
//!
//! Every series is a gauge, totals included. Each refresh overwrites the
//! value with the current snapshot, and
//! [`CacheRegistry::reset_stats`] drops the totals back to zero, which a
//! Prometheus counter may not do.

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::cache::registry::CacheRegistry;
use crate::cache::stats::{StatsSnapshot, TierStats};
use crate::error::{Error, Result};
use crate::sync::SyncStats;

const NAMESPACE: &str = "meshcache";

/// Prometheus view of one node's caches
pub struct CacheMetricsExporter {
    registry: Registry,

    // Per cache and tier
    hits: GaugeVec,
    misses: GaugeVec,
    puts: GaugeVec,
    evictions: GaugeVec,
    tier_hit_ratio: GaugeVec,
    size: GaugeVec,

    // Per cache
    requests: GaugeVec,
    hit_ratio: GaugeVec,
    loads: GaugeVec,
    load_failures: GaugeVec,
    load_seconds: GaugeVec,

    // Per outcome
    sync_events: GaugeVec,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl CacheMetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let tiered = &["cache", "tier"];
        let per_cache = &["cache"];

        Ok(Self {
            hits: gauge_vec(&registry, "hits", "Cache hits per tier", tiered)?,
            misses: gauge_vec(&registry, "misses", "Cache misses per tier", tiered)?,
            puts: gauge_vec(&registry, "puts", "Entries written per tier", tiered)?,
            evictions: gauge_vec(&registry, "evictions", "Entries evicted per tier", tiered)?,
            tier_hit_ratio: gauge_vec(&registry, "tier_hit_ratio", "Hit ratio per tier", tiered)?,
            size: gauge_vec(&registry, "size", "Estimated entries per tier", tiered)?,
            requests: gauge_vec(&registry, "requests", "Lookups received", per_cache)?,
            hit_ratio: gauge_vec(
                &registry,
                "hit_ratio",
                "Share of lookups served by L1 or L2",
                per_cache,
            )?,
            loads: gauge_vec(&registry, "loads", "Loader invocations", per_cache)?,
            load_failures: gauge_vec(&registry, "load_failures", "Failed loads", per_cache)?,
            load_seconds: gauge_vec(
                &registry,
                "load_seconds",
                "Total time spent in loaders",
                per_cache,
            )?,
            sync_events: gauge_vec(
                &registry,
                "sync_events",
                "Inbound cache events by outcome",
                &["outcome"],
            )?,
            registry,
        })
    }

    /// Pull the current stats of every cache in `caches`
    pub async fn refresh(&self, caches: &CacheRegistry) {
        for snapshot in caches.stats_all().await {
            self.observe(&snapshot);
        }
    }

    /// Record one cache's snapshot
    pub fn observe(&self, s: &StatsSnapshot) {
        let name = s.cache_name.as_str();
        self.observe_tier(name, "l1", &s.l1);
        self.observe_tier(name, "l2", &s.l2);

        self.requests.with_label_values(&[name]).set(s.requests as f64);
        self.hit_ratio.with_label_values(&[name]).set(s.hit_ratio);
        self.loads.with_label_values(&[name]).set(s.loads as f64);
        self.load_failures
            .with_label_values(&[name])
            .set(s.load_failures as f64);
        self.load_seconds
            .with_label_values(&[name])
            .set(s.total_load_time.as_secs_f64());
    }

    fn observe_tier(&self, name: &str, tier: &str, t: &TierStats) {
        let labels: &[&str] = &[name, tier];
        self.hits.with_label_values(labels).set(t.hits as f64);
        self.misses.with_label_values(labels).set(t.misses as f64);
        self.puts.with_label_values(labels).set(t.puts as f64);
        self.evictions.with_label_values(labels).set(t.evictions as f64);
        self.tier_hit_ratio.with_label_values(labels).set(t.hit_ratio);
        self.size.with_label_values(labels).set(t.estimated_size as f64);
    }

    /// Record the sync agent's counters
    pub fn observe_sync(&self, stats: &SyncStats) {
        for (outcome, value) in [
            ("applied", stats.applied),
            ("self_originated", stats.self_originated),
            ("duplicate", stats.duplicates),
            ("skipped", stats.skipped),
            ("failed", stats.failed),
        ] {
            self.sync_events
                .with_label_values(&[outcome])
                .set(value as f64);
        }
    }

    /// Content type of [`gather_text`](Self::gather_text)
    pub fn format_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }

    /// Encode every metric in the text exposition format
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics not UTF-8: {}", e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::config::CacheSettings;
    use serde_json::json;

    #[tokio::test]
    async fn test_refresh_exports_tier_labels() {
        let cluster = InMemoryCluster::new();
        let caches = CacheRegistry::new(CacheSettings::default(), cluster.backends());
        caches
            .get("users", "42", || async { Ok(Some(json!({"id": 42}))) })
            .await
            .unwrap();
        caches.get("users", "42", || async { Ok(None) }).await.unwrap();

        let exporter = CacheMetricsExporter::new().unwrap();
        exporter.refresh(&caches).await;
        let text = exporter.gather_text().unwrap();

        assert!(text.contains(r#"meshcache_hits{cache="users",tier="l1"} 1"#));
        assert!(text.contains(r#"meshcache_loads{cache="users"} 1"#));
        assert!(text.contains(r#"meshcache_size{cache="users",tier="l1"} 1"#));
    }

    #[tokio::test]
    async fn test_refresh_follows_stats_reset() {
        let cluster = InMemoryCluster::new();
        let caches = CacheRegistry::new(CacheSettings::default(), cluster.backends());
        caches.put("users", "1", Some(json!(1))).await.unwrap();
        for _ in 0..3 {
            caches.get("users", "1", || async { Ok(None) }).await.unwrap();
        }

        let exporter = CacheMetricsExporter::new().unwrap();
        exporter.refresh(&caches).await;
        let text = exporter.gather_text().unwrap();
        assert!(text.contains(r#"meshcache_hits{cache="users",tier="l1"} 3"#));
        assert!(text.contains(r#"meshcache_requests{cache="users"} 3"#));

        assert!(caches.reset_stats("users"));
        exporter.refresh(&caches).await;
        let text = exporter.gather_text().unwrap();
        assert!(text.contains(r#"meshcache_hits{cache="users",tier="l1"} 0"#));
        assert!(text.contains(r#"meshcache_requests{cache="users"} 0"#));
        assert!(text.contains(r#"meshcache_size{cache="users",tier="l1"} 1"#));
        assert!(text.contains("# TYPE meshcache_hits gauge"));
    }

    #[test]
    fn test_sync_outcomes() {
        let exporter = CacheMetricsExporter::new().unwrap();
        exporter.observe_sync(&SyncStats {
            applied: 3,
            duplicates: 1,
            ..SyncStats::default()
        });
        let text = exporter.gather_text().unwrap();
        assert!(text.contains(r#"meshcache_sync_events{outcome="applied"} 3"#));
        assert!(text.contains(r#"meshcache_sync_events{outcome="duplicate"} 1"#));
    }

    #[test]
    fn test_exporters_are_independent() {
        // private registries never collide on names
        assert!(CacheMetricsExporter::new().is_ok());
        assert!(CacheMetricsExporter::new().is_ok());
    }
}
