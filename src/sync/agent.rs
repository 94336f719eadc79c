//! Sync Agent
//!
//! Applies cache events published by other nodes to this node's L1. L2 is
//! never touched here: the publishing node already wrote it.
//!
//! For each inbound event:
//!
//! 1. drop it if this node published it
//! 2. drop it if its id is in the dedup window
//! 3. record the id, then dispatch on the event type

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dedup::DedupWindow;
use crate::cache::pattern::KeyPattern;
use crate::cache::registry::CacheRegistry;
use crate::config::DedupSettings;
use crate::domain::events::{CacheEvent, CacheEventType};
use crate::error::{Error, Result};

/// What happened to one inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// L1 was updated
    Applied,
    /// Published by this node
    SelfOriginated,
    /// Already applied
    Duplicate,
    /// Names a cache this node does not host; nothing to invalidate
    UnknownCache,
    /// Event type this node does not understand
    Unsupported,
}

/// Counters per outcome
#[derive(Debug, Default)]
struct AgentCounters {
    applied: AtomicU64,
    self_originated: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time agent counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub self_originated: u64,
    pub duplicates: u64,
    /// Unknown caches and unsupported types
    pub skipped: u64,
    pub failed: u64,
}

/// Inbound event consumer of one node
pub struct SyncAgent {
    registry: Arc<CacheRegistry>,
    dedup: Option<Mutex<DedupWindow>>,
    counters: AgentCounters,
}

impl SyncAgent {
    pub fn new(registry: Arc<CacheRegistry>, dedup: &DedupSettings) -> Self {
        Self {
            registry,
            dedup: dedup
                .enabled
                .then(|| Mutex::new(DedupWindow::new(dedup.ttl, dedup.max_size))),
            counters: AgentCounters::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.registry.node_id()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            self_originated: self.counters.self_originated.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Handle one inbound event
    pub fn on_event(&self, event: &CacheEvent) -> Result<EventOutcome> {
        let outcome = self.filter(event).map_or_else(|| self.apply(event), Ok);
        let counter = match &outcome {
            Ok(EventOutcome::Applied) => &self.counters.applied,
            Ok(EventOutcome::SelfOriginated) => &self.counters.self_originated,
            Ok(EventOutcome::Duplicate) => &self.counters.duplicates,
            Ok(EventOutcome::UnknownCache | EventOutcome::Unsupported) => &self.counters.skipped,
            Err(_) => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Self and duplicate filtering; records the id of events that pass
    fn filter(&self, event: &CacheEvent) -> Option<EventOutcome> {
        if event.is_from(self.node_id()) {
            return Some(EventOutcome::SelfOriginated);
        }
        if let Some(dedup) = &self.dedup {
            if !dedup.lock().check_and_record(&event.event_id, Instant::now()) {
                debug!(event_id = %event.event_id, "Dropping duplicate cache event");
                return Some(EventOutcome::Duplicate);
            }
        }
        None
    }

    fn apply(&self, event: &CacheEvent) -> Result<EventOutcome> {
        let name = event.cache_name.as_str();

        match event.event_type {
            CacheEventType::Put => {
                let (key, value) = match (&event.key, &event.value) {
                    (Some(key), Some(value)) => (key, value),
                    _ => return Err(malformed(event, "key and value")),
                };
                let cache = self.registry.cache(name);
                cache.local().put(key.clone(), value.clone(), cache.local_ttl(value));
            }
            CacheEventType::BatchPut => {
                let cache = self.registry.cache(name);
                for (key, value) in &event.entries {
                    cache.local().put(key.clone(), value.clone(), cache.local_ttl(value));
                }
            }
            CacheEventType::Remove => {
                let key = event.key.as_deref().ok_or_else(|| malformed(event, "key"))?;
                let Some(cache) = self.registry.existing(name) else {
                    return Ok(EventOutcome::UnknownCache);
                };
                cache.local().invalidate(key);
            }
            CacheEventType::BatchRemove => {
                let Some(cache) = self.registry.existing(name) else {
                    return Ok(EventOutcome::UnknownCache);
                };
                cache
                    .local()
                    .invalidate_many(event.keys.iter().map(String::as_str));
            }
            CacheEventType::Clear => {
                let Some(cache) = self.registry.existing(name) else {
                    return Ok(EventOutcome::UnknownCache);
                };
                cache.local().invalidate_all();
            }
            CacheEventType::RemovePattern => {
                let glob = event
                    .pattern
                    .as_deref()
                    .ok_or_else(|| malformed(event, "pattern"))?;
                let Some(cache) = self.registry.existing(name) else {
                    return Ok(EventOutcome::UnknownCache);
                };
                let pattern = KeyPattern::new(glob)?;
                let removed = cache.local().invalidate_matching(|key| pattern.matches(key));
                debug!(cache = %name, pattern = %glob, removed, "Applied pattern eviction");
            }
            CacheEventType::Expire => {
                let (key, ttl) = match (&event.key, event.ttl()) {
                    (Some(key), Some(ttl)) => (key, ttl),
                    _ => return Err(malformed(event, "key and ttl")),
                };
                let Some(cache) = self.registry.existing(name) else {
                    return Ok(EventOutcome::UnknownCache);
                };
                cache.local().expire(key, ttl);
            }
            CacheEventType::Unknown => {
                warn!(
                    cache = %name,
                    event_id = %event.event_id,
                    "Ignoring unsupported cache event type"
                );
                return Ok(EventOutcome::Unsupported);
            }
        }

        debug!(
            cache = %name,
            event_type = %event.event_type,
            event_id = %event.event_id,
            source = %event.source_node_id,
            "Applied remote cache event"
        );
        Ok(EventOutcome::Applied)
    }

    /// Consume `events` until the stream ends or `cancel` fires
    pub async fn run(&self, mut events: BoxStream<'static, CacheEvent>, cancel: CancellationToken) {
        info!(node_id = %self.node_id(), "Sync agent started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(event) => {
                        if let Err(e) = self.on_event(&event) {
                            error!(
                                cache = %event.cache_name,
                                event_id = %event.event_id,
                                error = %e,
                                "Failed to apply cache event"
                            );
                        }
                    }
                    None => {
                        warn!(node_id = %self.node_id(), "Cache event stream closed");
                        break;
                    }
                },
            }
        }
        info!(node_id = %self.node_id(), stats = ?self.stats(), "Sync agent stopped");
    }
}

fn malformed(event: &CacheEvent, missing: &str) -> Error {
    Error::EventHandler(format!(
        "{} event {} is missing {}",
        event.event_type, event.event_id, missing
    ))
}

/// Running sync agent
pub struct SyncHandle {
    agent: Arc<SyncAgent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Spawn `agent` over an already subscribed stream
    pub fn spawn(agent: Arc<SyncAgent>, events: BoxStream<'static, CacheEvent>) -> Self {
        let cancel = CancellationToken::new();
        let task = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(events, cancel).await })
        };
        Self {
            agent,
            cancel,
            task,
        }
    }

    pub fn agent(&self) -> &Arc<SyncAgent> {
        &self.agent
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop dispatching and wait for the task to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Sync agent task failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
