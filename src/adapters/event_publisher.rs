//! Event Publisher Decorators
//!
//! Wrappers around an [`EventChannel`] that observe what a node publishes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::{debug, info};

use crate::domain::events::{CacheEvent, CacheEventType};
use crate::domain::ports::EventChannel;
use crate::error::Result;

/// Logs every published event, then forwards it.
///
/// Useful for development, debugging, and audit trails.
pub struct LoggingEventChannel {
    inner: Arc<dyn EventChannel>,
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventChannel {
    /// Log at debug level
    pub fn new(inner: Arc<dyn EventChannel>) -> Self {
        Self {
            inner,
            info_level: false,
        }
    }

    /// Log at info level
    pub fn info_level(inner: Arc<dyn EventChannel>) -> Self {
        Self {
            inner,
            info_level: true,
        }
    }
}

#[async_trait]
impl EventChannel for LoggingEventChannel {
    async fn publish(&self, topic: &str, event: &CacheEvent) -> Result<()> {
        let json = event.encode().unwrap_or_else(|_| format!("{:?}", event));
        if self.info_level {
            info!(topic = %topic, event_type = %event.event_type, event = %json, "Cache event");
        } else {
            debug!(topic = %topic, event_type = %event.event_type, event = %json, "Cache event");
        }
        self.inner.publish(topic, event).await
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, CacheEvent>> {
        self.inner.subscribe(topic).await
    }
}

/// Records successfully published events for later inspection.
///
/// Used by `meshcache simulate` and tests to see what a node announced.
pub struct RecordingEventChannel {
    inner: Arc<dyn EventChannel>,
    events: parking_lot::RwLock<Vec<CacheEvent>>,
}

impl RecordingEventChannel {
    pub fn new(inner: Arc<dyn EventChannel>) -> Self {
        Self {
            inner,
            events: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Get all recorded events.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().clone()
    }

    /// Get the count of recorded events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clear all recorded events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: CacheEventType) -> Vec<CacheEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventChannel for RecordingEventChannel {
    async fn publish(&self, topic: &str, event: &CacheEvent) -> Result<()> {
        self.inner.publish(topic, event).await?;
        self.events.write().push(event.clone());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, CacheEvent>> {
        self.inner.subscribe(topic).await
    }
}
