//! Cache Entry Types
//!
//! Values held by either tier. A confirmed "does not exist" result is stored
//! as [`CachedValue::NullMarker`] so that it can be told apart from a miss.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Payload stored in L1, L2 and carried by put events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedValue {
    /// A real value
    Value(serde_json::Value),
    /// Cached "absent" result (penetration protection)
    NullMarker,
}

impl CachedValue {
    /// Whether this is the null marker
    #[inline]
    pub fn is_null_marker(&self) -> bool {
        matches!(self, CachedValue::NullMarker)
    }

    /// The payload, `None` for the null marker
    pub fn into_value(self) -> Option<serde_json::Value> {
        match self {
            CachedValue::Value(v) => Some(v),
            CachedValue::NullMarker => None,
        }
    }
}

impl From<serde_json::Value> for CachedValue {
    fn from(value: serde_json::Value) -> Self {
        CachedValue::Value(value)
    }
}

/// Entry held by one tier; each tier owns an independent copy
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Cache key
    pub key: String,
    /// Stored payload
    pub value: CachedValue,
    /// When the entry was (re)written
    pub inserted_at: Instant,
    /// Time to live from `inserted_at` (`None` = no per-entry TTL)
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    /// Create a new entry stamped now
    pub fn new(key: impl Into<String>, value: CachedValue, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    /// Check if the per-entry TTL has elapsed
    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.inserted_at) >= ttl,
            None => false,
        }
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
    fn test_null_marker_distinct_from_json_null() {
        let marker = CachedValue::NullMarker;
        let json_null = CachedValue::Value(serde_json::Value::Null);
        assert_ne!(marker, json_null);

        let encoded = serde_json::to_string(&marker).unwrap();
        assert_eq!(encoded, "\"null_marker\"");
        let decoded: CachedValue = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.is_null_marker());

        let encoded = serde_json::to_string(&json_null).unwrap();
        let decoded: CachedValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, json_null);
    }

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new("k", json!(1).into(), Some(Duration::from_millis(50)));
        assert!(!entry.is_expired_at(Instant::now()));
        assert!(entry.is_expired_at(entry.inserted_at + Duration::from_millis(50)));

        let forever = CacheEntry::new("k", json!(1).into(), None);
        assert!(!forever.is_expired_at(Instant::now() + Duration::from_secs(3600)));
    }
}
