//! Dedup Window
//!
//! Remembers recently applied event ids so that redelivered events are
//! applied once. Bounded by age and by entry count.
//!
//! ```text
//! DedupWindow
//!     ├── seen:  HashSet<event_id>
//!     └── order: VecDeque<(event_id, seen_at)>   // oldest first
//! ```

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

/// Time- and size-bounded set of seen event ids
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<(String, Instant)>,
    ttl: Duration,
    max_size: usize,
}

impl DedupWindow {
    /// Window remembering ids for `ttl`, at most `max_size` of them
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            ttl,
            max_size: max_size.max(1),
        }
    }

    /// Record `event_id`; false when it is already in the window.
    /// Expired ids are pruned first.
    pub fn check_and_record(&mut self, event_id: &str, now: Instant) -> bool {
        self.prune(now);
        if self.seen.contains(event_id) {
            return false;
        }

        while self.order.len() >= self.max_size {
            if let Some((oldest, _)) = self.order.pop_front() {
                trace!(event_id = %oldest, "Dedup window full, forgetting oldest id");
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(event_id.to_string());
        self.order.push_back((event_id.to_string(), now));
        true
    }

    /// Forget ids older than the TTL; returns how many were dropped
    pub fn prune(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        while let Some((_, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < self.ttl {
                break;
            }
            if let Some((id, _)) = self.order.pop_front() {
                self.seen.remove(&id);
                dropped += 1;
            }
        }
        dropped
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.seen.contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected() {
        let mut window = DedupWindow::new(Duration::from_secs(60), 10);
        let now = Instant::now();
        assert!(window.check_and_record("e1", now));
        assert!(!window.check_and_record("e1", now));
        assert!(window.check_and_record("e2", now));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_expired_ids_are_pruned() {
        let mut window = DedupWindow::new(Duration::from_secs(60), 10);
        let start = Instant::now();
        window.check_and_record("old", start);
        window.check_and_record("new", start + Duration::from_secs(30));

        let later = start + Duration::from_secs(61);
        assert_eq!(window.prune(later), 1);
        assert!(!window.contains("old"));
        assert!(window.contains("new"));

        // once forgotten, the id is accepted again
        assert!(window.check_and_record("old", later));
    }

    #[test]
    fn test_size_bound_drops_oldest() {
        let mut window = DedupWindow::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        for id in ["a", "b", "c", "d"] {
            assert!(window.check_and_record(id, now));
        }
        assert_eq!(window.len(), 3);
        assert!(!window.contains("a"));
        assert!(window.contains("d"));
    }
}
