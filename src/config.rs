//! Cache Configuration
//!
//! Process-wide settings plus per-cache overrides. Loaded once at startup
//! and immutable afterwards.
//!
//! # Example
//!
//! ```yaml
//! node_id: node-a
//! sync:
//!   topic: "cache:events"
//! default_config:
//!   remote:
//!     time_to_live_ms: 1800000
//! caches:
//!   users:
//!     local:
//!       max_size: 5000
//!     protection:
//!       ttl_variance: 0.2
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default event topic shared by all nodes
pub const DEFAULT_TOPIC: &str = "cache:events";

// =============================================================================
// Process-wide Settings
// =============================================================================

/// Settings for one cache node (all caches it hosts)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Fixed node id; a random UUID is generated when unset
    pub node_id: Option<String>,
    /// Event propagation
    pub sync: SyncSettings,
    /// Inbound event deduplication
    pub dedup: DedupSettings,
    /// Periodic stats reporting
    pub stats: StatsSettings,
    /// L1 warm-up at startup
    pub warmup: WarmupSettings,
    /// Config applied to caches without an override
    pub default_config: CacheConfig,
    /// Per-cache overrides keyed by cache name
    pub caches: HashMap<String, CacheConfig>,
}

impl CacheSettings {
    /// Parse settings from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid cache settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Config for a cache name, falling back to the default config
    pub fn config_for(&self, cache_name: &str) -> &CacheConfig {
        self.caches.get(cache_name).unwrap_or(&self.default_config)
    }

    /// Validate every cache config
    pub fn validate(&self) -> Result<()> {
        if self.sync.topic.is_empty() {
            return Err(Error::Config("sync.topic must not be empty".into()));
        }
        if self.dedup.enabled && self.dedup.max_size == 0 {
            return Err(Error::Config("dedup.max_size must be > 0".into()));
        }
        if self.warmup.warm_on_start && self.warmup.timeout.is_zero() {
            return Err(Error::Config("warmup.timeout_ms must be > 0".into()));
        }
        self.default_config.validate("default_config")?;
        for (name, config) in &self.caches {
            config.validate(name)?;
        }
        Ok(())
    }
}

/// Event propagation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Publish and consume cache events
    pub enabled: bool,
    /// Pub/sub topic shared by all nodes
    pub topic: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

/// Dedup window settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// Drop redelivered events
    pub enabled: bool,
    /// How long a seen event id is remembered
    #[serde(rename = "ttl_ms", with = "duration_ms")]
    pub ttl: Duration,
    /// Upper bound on remembered ids
    pub max_size: usize,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 10_000,
        }
    }
}

/// Stats reporting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    /// Run the periodic stats reporter
    pub enabled: bool,
    /// Reporting interval
    #[serde(rename = "log_interval_ms", with = "duration_ms")]
    pub log_interval: Duration,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_interval: Duration::from_secs(300),
        }
    }
}

/// Startup warm-up settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupSettings {
    /// Fill every configured cache's L1 from L2 before sync starts
    pub warm_on_start: bool,
    /// Upper bound on the whole warm-up
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for WarmupSettings {
    fn default() -> Self {
        Self {
            warm_on_start: false,
            timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Per-cache Configuration
// =============================================================================

/// Configuration of one named cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 sizing and expiry
    pub local: LocalConfig,
    /// L2 expiry
    pub remote: RemoteConfig,
    /// Stampede / penetration / avalanche guards
    pub protection: ProtectionConfig,
    /// Batch chunking
    pub batch: BatchConfig,
    /// Publish events for this cache
    pub sync_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            protection: ProtectionConfig::default(),
            batch: BatchConfig::default(),
            sync_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Check value ranges; `scope` names the config in the error
    pub fn validate(&self, scope: &str) -> Result<()> {
        if self.local.max_size == 0 {
            return Err(Error::Config(format!("{}: local.max_size must be > 0", scope)));
        }
        if self.batch.max_size == 0 {
            return Err(Error::Config(format!("{}: batch.max_size must be > 0", scope)));
        }
        let variance = self.protection.ttl_variance;
        if !(0.0..1.0).contains(&variance) {
            return Err(Error::Config(format!(
                "{}: protection.ttl_variance must be in [0, 1), got {}",
                scope, variance
            )));
        }
        if self.protection.lock_enabled && self.protection.lock_lease_time.is_zero() {
            return Err(Error::Config(format!(
                "{}: protection.lock_lease_time must be > 0",
                scope
            )));
        }
        Ok(())
    }
}

/// L1 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Maximum number of entries (LRU beyond this)
    pub max_size: usize,
    /// Expiry measured from the last write (zero disables)
    #[serde(rename = "expire_after_write_ms", with = "duration_ms")]
    pub expire_after_write: Duration,
    /// Expiry measured from the last read (zero disables)
    #[serde(rename = "expire_after_access_ms", with = "duration_ms")]
    pub expire_after_access: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            expire_after_write: Duration::from_secs(600),
            expire_after_access: Duration::from_secs(300),
        }
    }
}

/// L2 configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base TTL for values written to L2
    #[serde(rename = "time_to_live_ms", with = "duration_ms")]
    pub time_to_live: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            time_to_live: Duration::from_secs(1800),
        }
    }
}

/// Protection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Guard misses with the distributed lock
    pub lock_enabled: bool,
    /// How long a miss waits for the load lock
    #[serde(rename = "lock_wait_time_ms", with = "duration_ms")]
    pub lock_wait_time: Duration,
    /// Upper bound on how long a load lock is held
    #[serde(rename = "lock_lease_time_ms", with = "duration_ms")]
    pub lock_lease_time: Duration,
    /// Cache "not found" results as a null marker
    pub null_value_enabled: bool,
    /// TTL of cached null markers
    #[serde(rename = "null_value_ttl_ms", with = "duration_ms")]
    pub null_value_ttl: Duration,
    /// Jitter write TTLs
    pub ttl_randomization_enabled: bool,
    /// Relative jitter, e.g. 0.1 for +/-10%
    pub ttl_variance: f64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            lock_enabled: true,
            lock_wait_time: Duration::from_millis(3000),
            lock_lease_time: Duration::from_millis(30_000),
            null_value_enabled: true,
            null_value_ttl: Duration::from_secs(300),
            ttl_randomization_enabled: true,
            ttl_variance: 0.1,
        }
    }
}

/// Batch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum keys per L2 round trip and per event
    pub max_size: usize,
    /// Timeout applied to each chunk's L2 call
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout: Duration::from_millis(5000),
        }
    }
}

/// Serde helper storing a `Duration` as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// =============================================================================
// Tests
// =============================================================================
