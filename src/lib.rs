//! meshcache - Multi-level Cache with Cross-node Synchronization
//!
//! An in-process cache (L1) layered over a shared networked store (L2),
//! kept coherent across application instances by cache events, and guarded
//! against stampede, penetration and avalanche.
//!
//! # Architecture
//!
//! ```text
//! caller ──► CacheRegistry ──► CacheCore ──► L1 / L2 / lock ──► EventChannel
//!                                                                   │
//!            other nodes ◄── SyncAgent (self filter, dedup) ◄───────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and Redis implementations of the ports
//! - [`cache`] - L1, TTL policy, stats, the cache core and registry
//! - [`config`] - Settings and per-cache configuration
//! - [`domain`] - Port traits and cache events
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus exposition of cache stats
//! - [`sync`] - Inbound event handling
//!
//! # Example
//!
//! ```ignore
//! use meshcache::adapters::memory::InMemoryCluster;
//! use meshcache::{CacheRegistry, CacheSettings};
//!
//! let cluster = InMemoryCluster::new();
//! let registry = std::sync::Arc::new(CacheRegistry::new(CacheSettings::default(), cluster.backends()));
//! let _sync = registry.start_sync().await?;
//!
//! let user = registry
//!     .get("users", "42", || async { Ok(Some(serde_json::json!({"id": 42}))) })
//!     .await?;
//! ```

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod sync;

// Re-export commonly used types
pub use cache::{Backends, CacheCore, CacheRegistry, CachedValue, StatsSnapshot};
pub use config::{CacheConfig, CacheSettings};
pub use domain::{CacheEvent, CacheEventType, NodeIdentity};
pub use error::{Error, Result};
pub use metrics::CacheMetricsExporter;
pub use sync::{SyncAgent, SyncHandle};
