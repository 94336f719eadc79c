//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │     RemoteStore │ DistributedLock │ EventChannel           │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryCluster │ RedisBackend (feature = "redis")         │ │
//! │  │ LoggingEventChannel │ RecordingEventChannel                │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use meshcache::adapters::InMemoryCluster;
//! use meshcache::{CacheRegistry, CacheSettings};
//!
//! // Nodes sharing one cluster see the same L2, locks and events
//! let cluster = InMemoryCluster::new();
//! let node = CacheRegistry::new(CacheSettings::default(), cluster.backends());
//! ```

pub mod event_publisher;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use event_publisher::{LoggingEventChannel, RecordingEventChannel};
pub use memory::{InMemoryCluster, InMemoryEventChannel, InMemoryLock, InMemoryRemoteStore};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;
