//! Cache Statistics
//!
//! Per-cache, per-tier counters. Advisory only: nothing in the cache path
//! reads these values to make decisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheTier {
    /// In-process cache
    L1,
    /// Shared remote store
    L2,
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheTier::L1 => write!(f, "L1 (local)"),
            CacheTier::L2 => write!(f, "L2 (remote)"),
        }
    }
}

/// Counters for one tier
#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
}

impl TierCounters {
    fn snapshot(&self, estimated_size: u64) -> TierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        TierStats {
            hits,
            misses,
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_ratio: ratio(hits, hits + misses),
            estimated_size,
        }
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }
}

/// Stats collector for one named cache
#[derive(Debug, Default)]
pub struct StatsCollector {
    l1: TierCounters,
    l2: TierCounters,
    requests: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
    total_load_time_nanos: AtomicU64,
}

impl StatsCollector {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    fn tier(&self, tier: CacheTier) -> &TierCounters {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }

    /// Count one key lookup; each lookup records at most one hit
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, tier: CacheTier) {
        self.tier(tier).hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, tier: CacheTier) {
        self.tier(tier).misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self, tier: CacheTier) {
        self.tier(tier).puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_puts(&self, tier: CacheTier, n: u64) {
        self.tier(tier).puts.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, tier: CacheTier) {
        self.tier(tier).evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, tier: CacheTier, n: u64) {
        self.tier(tier).evictions.fetch_add(n, Ordering::Relaxed);
    }

    /// Record a loader invocation and how long it took
    pub fn record_load(&self, elapsed: Duration, success: bool) {
        if success {
            self.loads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_load_time_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Point-in-time view; sizes are supplied by the caller
    pub fn snapshot(&self, cache_name: &str, l1_size: u64, l2_size: u64) -> StatsSnapshot {
        let l1 = self.l1.snapshot(l1_size);
        let l2 = self.l2.snapshot(l2_size);
        let loads = self.loads.load(Ordering::Relaxed);
        let load_failures = self.load_failures.load(Ordering::Relaxed);
        let total_load_nanos = self.total_load_time_nanos.load(Ordering::Relaxed);
        let load_attempts = loads + load_failures;
        let requests = self.requests.load(Ordering::Relaxed);

        StatsSnapshot {
            cache_name: cache_name.to_string(),
            requests,
            hit_ratio: ratio(l1.hits + l2.hits, requests),
            loads,
            load_failures,
            total_load_time: Duration::from_nanos(total_load_nanos),
            average_load_penalty: Duration::from_nanos(
                total_load_nanos.checked_div(load_attempts).unwrap_or(0),
            ),
            l1,
            l2,
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.l1.reset();
        self.l2.reset();
        self.requests.store(0, Ordering::Relaxed);
        self.loads.store(0, Ordering::Relaxed);
        self.load_failures.store(0, Ordering::Relaxed);
        self.total_load_time_nanos.store(0, Ordering::Relaxed);
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Counters of one tier at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
    pub estimated_size: u64,
}

/// Immutable point-in-time view of one cache's stats
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub cache_name: String,
    pub l1: TierStats,
    pub l2: TierStats,
    /// Lookups received (each starts at L1)
    pub requests: u64,
    /// Share of requests served from either tier
    pub hit_ratio: f64,
    pub loads: u64,
    pub load_failures: u64,
    pub total_load_time: Duration,
    /// Mean loader latency across successful and failed loads
    pub average_load_penalty: Duration,
}

impl StatsSnapshot {
    /// Stats for one tier
    pub fn tier(&self, tier: CacheTier) -> &TierStats {
        match tier {
            CacheTier::L1 => &self.l1,
            CacheTier::L2 => &self.l2,
        }
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_creation() {
        let stats = StatsCollector::new();
        let snapshot = stats.snapshot("users", 0, 0);
        assert_eq!(snapshot.l1.hits, 0);
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.hit_ratio, 0.0);
        assert_eq!(snapshot.average_load_penalty, Duration::ZERO);
    }

    #[test]
    fn test_hit_ratio() {
        let stats = StatsCollector::new();

        // two L1 hits, one L1 miss served by L2, one full miss
        for _ in 0..4 {
            stats.record_request();
        }
        stats.record_hit(CacheTier::L1);
        stats.record_hit(CacheTier::L1);
        stats.record_miss(CacheTier::L1);
        stats.record_hit(CacheTier::L2);
        stats.record_miss(CacheTier::L1);
        stats.record_miss(CacheTier::L2);

        let snapshot = stats.snapshot("users", 3, 4);
        assert_eq!(snapshot.requests, 4);
        assert!((snapshot.hit_ratio - 0.75).abs() < 1e-9);
        assert!((snapshot.l1.hit_ratio - 0.5).abs() < 1e-9);
        assert!((snapshot.l2.hit_ratio - 0.5).abs() < 1e-9);
        assert_eq!(snapshot.l1.estimated_size, 3);
        assert_eq!(snapshot.tier(CacheTier::L2).estimated_size, 4);
    }

    #[test]
    fn test_average_load_penalty() {
        let stats = StatsCollector::new();
        stats.record_load(Duration::from_millis(10), true);
        stats.record_load(Duration::from_millis(30), false);

        let snapshot = stats.snapshot("users", 0, 0);
        assert_eq!(snapshot.loads, 1);
        assert_eq!(snapshot.load_failures, 1);
        assert_eq!(snapshot.total_load_time, Duration::from_millis(40));
        assert_eq!(snapshot.average_load_penalty, Duration::from_millis(20));
    }

    #[test]
    fn test_average_load_penalty_past_u32_loads() {
        let stats = StatsCollector::new();
        stats.loads.store(1 << 32, Ordering::Relaxed);
        stats
            .total_load_time_nanos
            .store(3 << 32, Ordering::Relaxed);

        let snapshot = stats.snapshot("users", 0, 0);
        assert_eq!(snapshot.loads, 1 << 32);
        assert_eq!(snapshot.average_load_penalty, Duration::from_nanos(3));
    }

    #[test]
    fn test_reset() {
        let stats = StatsCollector::new();
        stats.record_request();
        stats.record_hit(CacheTier::L1);
        stats.record_puts(CacheTier::L2, 5);
        stats.record_evictions(CacheTier::L1, 2);
        stats.record_load(Duration::from_millis(1), true);

        stats.reset();

        let snapshot = stats.snapshot("users", 0, 0);
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.l1.hits, 0);
        assert_eq!(snapshot.l2.puts, 0);
        assert_eq!(snapshot.l1.evictions, 0);
        assert_eq!(snapshot.loads, 0);
    }

    #[test]
    fn test_tier_display() {
        assert_eq!(format!("{}", CacheTier::L1), "L1 (local)");
        assert_eq!(format!("{}", CacheTier::L2), "L2 (remote)");
    }

    #[test]
    fn test_latency_tracker() {
        let tracker = LatencyTracker::start();
        std::thread::sleep(Duration::from_millis(5));
        assert!(tracker.elapsed() >= Duration::from_millis(5));
    }
}
