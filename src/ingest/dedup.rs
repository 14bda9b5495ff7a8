// src/ingest/dedup.rs
//! Dedup-key index with a retention window.
//!
//! A key stays "seen" until it is older than `window` or until `capacity`
//! newer keys pushed it out, whichever comes first. Expiry is FIFO and
//! amortized O(1) per insert. Not synchronized; the collection buffer owns
//! it inside its own critical section.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupIndex {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    window: Duration,
    capacity: usize,
}

impl DedupIndex {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Record `key` at `now`. Returns `true` if the key was not live (i.e. the
    /// item is new), `false` for a duplicate.
    pub fn insert(&mut self, key: &str, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(key) {
            return false;
        }
        self.seen.insert(key.to_string(), now);
        self.order.push_back((key.to_string(), now));
        while self.seen.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    pub fn contains(&self, key: &str, now: Instant) -> bool {
        match self.seen.get(key) {
            Some(at) => now.saturating_duration_since(*at) < self.window,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) >= self.window {
                self.pop_oldest();
            } else {
                break;
            }
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((key, at)) = self.order.pop_front() {
            // Only drop the map entry if it still belongs to this insertion.
            if self.seen.get(&key) == Some(&at) {
                self.seen.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_within_window_is_rejected() {
        let t0 = Instant::now();
        let mut idx = DedupIndex::new(Duration::from_secs(600), 100);
        assert!(idx.insert("a", t0));
        assert!(!idx.insert("a", t0 + Duration::from_secs(61)));
        assert!(idx.insert("b", t0 + Duration::from_secs(61)));
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn key_is_new_again_after_window() {
        let t0 = Instant::now();
        let mut idx = DedupIndex::new(Duration::from_secs(60), 100);
        assert!(idx.insert("a", t0));
        assert!(idx.contains("a", t0 + Duration::from_secs(59)));
        assert!(idx.insert("a", t0 + Duration::from_secs(60)));
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let t0 = Instant::now();
        let mut idx = DedupIndex::new(Duration::from_secs(600), 2);
        idx.insert("a", t0);
        idx.insert("b", t0);
        idx.insert("c", t0);
        assert_eq!(idx.len(), 2);
        assert!(!idx.contains("a", t0));
        assert!(idx.contains("c", t0));
    }
}
