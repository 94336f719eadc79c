//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the shared store, lock and pub/sub
//! - **Events** (`events.rs`) - Cache mutation events exchanged between nodes
//!
//! # Usage
//!
//! ```ignore
//! use meshcache::domain::{CacheEvent, EventChannel};
//!
//! async fn announce(channel: &dyn EventChannel, node: &str) -> meshcache::Result<()> {
//!     channel.publish("cache:events", &CacheEvent::clear("users", node)).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{CacheEvent, CacheEventType};
pub use ports::{
    DistributedLock, EventChannel, LockGuard, LockLease, NodeIdentity, RemoteStore,
};
