//! Domain Ports (Port/Adapter Pattern)
//!
//! The shared infrastructure a cache node depends on. Adapters in
//! [`crate::adapters`] implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Cache Core                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  RemoteStore │ DistributedLock │ EventChannel       │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  InMemory* (shared in-process) │ Redis* (feature)   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every node of a cluster holds handles to the same store, lock service
//! and channel. Keys are namespaced by cache name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

use super::events::CacheEvent;
use crate::cache::entry::CachedValue;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// Process-unique node id, stamped on every published event
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeIdentity(String);

impl NodeIdentity {
    /// Use a configured id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Configured id when present, otherwise a random one
    pub fn from_config(id: Option<&str>) -> Self {
        match id {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of a held distributed lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    /// Lock name
    pub name: String,
    /// Holder token; only the holder can release the lock
    pub token: String,
}

impl LockLease {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

// =============================================================================
// Port Traits
// =============================================================================

/// Port for the shared L2 store.
///
/// The authoritative tier: a `put` followed by a read from any node observes
/// the new value. Failures surface as `Error::RemoteStoreUnavailable`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    async fn get(&self, cache: &str, key: &str) -> Result<Option<CachedValue>>;

    async fn put(&self, cache: &str, key: &str, value: CachedValue, ttl: Duration) -> Result<()>;

    /// Returns whether the key existed
    async fn remove(&self, cache: &str, key: &str) -> Result<bool>;

    /// Returns the number of removed keys
    async fn clear(&self, cache: &str) -> Result<u64>;

    /// Present keys only
    async fn get_all(&self, cache: &str, keys: &[String]) -> Result<HashMap<String, CachedValue>>;

    /// One round trip for the whole slice
    async fn put_all(
        &self,
        cache: &str,
        entries: &[(String, CachedValue)],
        ttl: Duration,
    ) -> Result<()>;

    /// One round trip for the whole slice; returns the number removed
    async fn remove_all(&self, cache: &str, keys: &[String]) -> Result<u64>;

    async fn keys(&self, cache: &str) -> Result<Vec<String>>;

    async fn size(&self, cache: &str) -> Result<u64>;

    /// Set a new TTL; returns whether the key existed
    async fn expire(&self, cache: &str, key: &str, ttl: Duration) -> Result<bool>;
}

/// Port for cross-process mutual exclusion.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Wait up to `wait` for the lock; `None` when the wait elapsed.
    /// The lock is released automatically after `lease`.
    async fn try_lock(&self, name: &str, wait: Duration, lease: Duration)
        -> Result<Option<LockLease>>;

    /// Release a held lock. Releasing an expired or foreign lease is a no-op.
    async fn unlock(&self, lease: &LockLease) -> Result<()>;
}

/// Port for the pub/sub transport shared by all nodes.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn publish(&self, topic: &str, event: &CacheEvent) -> Result<()>;

    /// Stream of every event published on `topic` after subscribing
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, CacheEvent>>;
}

// =============================================================================
// Scoped Lock Release
// =============================================================================

/// Releases a held lock when dropped.
///
/// Prefer [`LockGuard::release`] so the unlock is awaited; dropping the guard
/// (early return, error, panic) spawns the unlock on the current runtime.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    lease: Option<LockLease>,
}

impl LockGuard {
    pub fn new(lock: Arc<dyn DistributedLock>, lease: LockLease) -> Self {
        Self {
            lock,
            lease: Some(lease),
        }
    }

    /// Name of the held lock
    pub fn name(&self) -> &str {
        self.lease.as_ref().map(|l| l.name.as_str()).unwrap_or_default()
    }

    /// Release now
    pub async fn release(mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => self.lock.unlock(&lease).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lock.unlock(&lease).await {
                        warn!(lock = %lease.name, error = %e, "Failed to release lock");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %lease.name, "No runtime to release lock, relying on lease expiry");
            }
        }
    }
}
