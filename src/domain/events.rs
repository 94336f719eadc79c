//! Cache Events
//!
//! Mutations broadcast between nodes so that every node's L1 stays coherent
//! with L2. Events are immutable once built and travel as JSON.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "eventType": "PUT",
//!   "cacheName": "users",
//!   "key": "42",
//!   "value": {"value": {"id": 42, "name": "A"}},
//!   "ttlMillis": 1800000,
//!   "sourceNodeId": "node-a",
//!   "eventId": "5d0c3f0e-...",
//!   "timestamp": "2024-05-01T12:00:00Z"
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::entry::CachedValue;
use crate::error::Result;

/// Kind of mutation carried by a [`CacheEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheEventType {
    Put,
    Remove,
    Clear,
    RemovePattern,
    BatchPut,
    BatchRemove,
    Expire,
    /// Any type this node does not understand
    #[serde(other)]
    Unknown,
}

impl fmt::Display for CacheEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheEventType::Put => "PUT",
            CacheEventType::Remove => "REMOVE",
            CacheEventType::Clear => "CLEAR",
            CacheEventType::RemovePattern => "REMOVE_PATTERN",
            CacheEventType::BatchPut => "BATCH_PUT",
            CacheEventType::BatchRemove => "BATCH_REMOVE",
            CacheEventType::Expire => "EXPIRE",
            CacheEventType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// A cache mutation as seen on the event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvent {
    pub event_type: CacheEventType,
    pub cache_name: String,
    /// Single key (`PUT`, `REMOVE`, `EXPIRE`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Keys of a `BATCH_REMOVE`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    /// Entries of a `BATCH_PUT`
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub entries: HashMap<String, CachedValue>,
    /// Glob of a `REMOVE_PATTERN`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CachedValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_millis: Option<u64>,
    pub source_node_id: String,
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    fn new(
        event_type: CacheEventType,
        cache_name: impl Into<String>,
        source_node_id: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            cache_name: cache_name.into(),
            key: None,
            keys: Vec::new(),
            entries: HashMap::new(),
            pattern: None,
            value: None,
            ttl_millis: None,
            source_node_id: source_node_id.into(),
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }

    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_millis = Some(ttl.as_millis() as u64);
        self
    }

    /// A key was written
    pub fn put(
        cache_name: &str,
        key: &str,
        value: CachedValue,
        ttl: Duration,
        source_node_id: &str,
    ) -> Self {
        let mut event = Self::new(CacheEventType::Put, cache_name, source_node_id).with_ttl(ttl);
        event.key = Some(key.to_string());
        event.value = Some(value);
        event
    }

    /// A key was evicted
    pub fn remove(cache_name: &str, key: &str, source_node_id: &str) -> Self {
        let mut event = Self::new(CacheEventType::Remove, cache_name, source_node_id);
        event.key = Some(key.to_string());
        event
    }

    /// The whole cache was cleared
    pub fn clear(cache_name: &str, source_node_id: &str) -> Self {
        Self::new(CacheEventType::Clear, cache_name, source_node_id)
    }

    /// Keys matching a glob were evicted
    pub fn remove_pattern(cache_name: &str, pattern: &str, source_node_id: &str) -> Self {
        let mut event = Self::new(CacheEventType::RemovePattern, cache_name, source_node_id);
        event.pattern = Some(pattern.to_string());
        event
    }

    /// One chunk of a batch write
    pub fn batch_put(
        cache_name: &str,
        entries: HashMap<String, CachedValue>,
        ttl: Duration,
        source_node_id: &str,
    ) -> Self {
        let mut event =
            Self::new(CacheEventType::BatchPut, cache_name, source_node_id).with_ttl(ttl);
        event.entries = entries;
        event
    }

    /// One chunk of a batch eviction
    pub fn batch_remove(cache_name: &str, keys: Vec<String>, source_node_id: &str) -> Self {
        let mut event = Self::new(CacheEventType::BatchRemove, cache_name, source_node_id);
        event.keys = keys;
        event
    }

    /// A key's TTL was changed
    pub fn expire(cache_name: &str, key: &str, ttl: Duration, source_node_id: &str) -> Self {
        let mut event = Self::new(CacheEventType::Expire, cache_name, source_node_id).with_ttl(ttl);
        event.key = Some(key.to_string());
        event
    }

    /// Carried TTL
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_millis.map(Duration::from_millis)
    }

    /// Whether `node_id` published this event
    #[inline]
    pub fn is_from(&self, node_id: &str) -> bool {
        self.source_node_id == node_id
    }

    /// Encode to the JSON wire format
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire format
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_event_wire_fields() {
        let event = CacheEvent::put(
            "users",
            "42",
            CachedValue::Value(json!({"id": 42, "name": "A"})),
            Duration::from_secs(1800),
            "node-a",
        );
        let wire: serde_json::Value = serde_json::from_str(&event.encode().unwrap()).unwrap();

        assert_eq!(wire["eventType"], "PUT");
        assert_eq!(wire["cacheName"], "users");
        assert_eq!(wire["key"], "42");
        assert_eq!(wire["ttlMillis"], 1_800_000);
        assert_eq!(wire["sourceNodeId"], "node-a");
        assert_eq!(wire["value"]["value"]["name"], "A");
        assert!(wire.get("keys").is_none());

        let decoded = CacheEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = CacheEvent::clear("users", "node-a");
        let b = CacheEvent::clear("users", "node-a");
        assert_ne!(a.event_id, b.event_id);
        assert!(a.is_from("node-a"));
        assert!(!a.is_from("node-b"));
    }

    #[test]
    fn test_batch_variants_carry_payloads() {
        let mut entries = HashMap::new();
        entries.insert("1".to_string(), CachedValue::Value(json!(1)));
        entries.insert("2".to_string(), CachedValue::NullMarker);
        let event = CacheEvent::batch_put("t", entries.clone(), Duration::from_millis(500), "n");
        let decoded = CacheEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.entries, entries);
        assert_eq!(decoded.ttl(), Some(Duration::from_millis(500)));

        let event = CacheEvent::batch_remove("t", vec!["1".into(), "2".into()], "n");
        let decoded = CacheEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded.keys, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(decoded.event_type, CacheEventType::BatchRemove);
    }

    #[test]
    fn test_unknown_event_type_decodes() {
        let raw = r#"{
            "eventType": "REFRESH_ALL",
            "cacheName": "users",
            "sourceNodeId": "node-z",
            "eventId": "e-1",
            "timestamp": "2024-05-01T12:00:00Z"
        }"#;
        let event = CacheEvent::decode(raw).unwrap();
        assert_eq!(event.event_type, CacheEventType::Unknown);
        assert_eq!(event.event_type.to_string(), "UNKNOWN");
    }
}
