//! Two-Level Cache
//!
//! In-process L1 over a shared L2, kept coherent across nodes by events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          Cache Registry                                   │
//! │                   (one CacheCore per cache name)                          │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 LocalCache (per process)   │  L2 RemoteStore (shared, authoritative)  │
//! │  ┌──────────────────────────┐  │  ┌────────────────────────────────────┐  │
//! │  │ LRU + write/access TTL   │  │  │ per-key TTL, batch get/put         │  │
//! │  └──────────────────────────┘  │  └────────────────────────────────────┘  │
//! │              │                 │                  │                       │
//! │              └─────────────────┴──────────────────┘                       │
//! │                               │                                           │
//! │        DistributedLock (load once)   EventChannel (L1 coherence)          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protections
//!
//! - Stampede: misses load under a per-key distributed lock with a re-check
//! - Penetration: absent results are cached as a null marker with a short TTL
//! - Avalanche: write TTLs are jittered by a configured variance

pub mod core;
pub mod entry;
pub mod local;
pub mod pattern;
pub mod registry;
pub mod stats;
pub mod ttl;

pub use self::core::{Backends, CacheCore, WarmupReport};
pub use entry::{CacheEntry, CachedValue};
pub use local::LocalCache;
pub use pattern::KeyPattern;
pub use registry::CacheRegistry;
pub use stats::{CacheTier, LatencyTracker, StatsCollector, StatsSnapshot, TierStats};
pub use ttl::TtlPolicy;
