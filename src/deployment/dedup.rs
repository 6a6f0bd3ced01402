//! Bounded set of seen log keys.
//!
//! When an insert grows the window past `capacity`, it is trimmed to the
//! `retain` most recently inserted keys. A line older than the horizon that
//! gets redelivered after a trim is accepted again; that loss is accepted in
//! exchange for bounded memory on long deployments.

use std::collections::{HashSet, VecDeque};

/// Size at which the window is trimmed.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Keys kept after a trim.
pub const DEFAULT_RETAIN: usize = 2000;

/// Insertion-ordered set of dedup keys with a hard size bound.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
    retain: usize,
}

impl DedupWindow {
    /// Window with explicit bounds; `retain` is clamped to `capacity`.
    pub fn new(capacity: usize, retain: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            capacity,
            retain: retain.min(capacity),
        }
    }

    /// Record `key`. Returns `false` if it was already seen.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            self.trim();
        }
        true
    }

    /// Whether `key` is inside the horizon.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn trim(&mut self) {
        let excess = self.order.len().saturating_sub(self.retain);
        for key in self.order.drain(..excess) {
            self.seen.remove(&key);
        }
        log::debug!("[Deploy] Dedup window trimmed to {} keys", self.order.len());
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RETAIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_is_rejected() {
        let mut window = DedupWindow::default();
        assert!(window.insert("t|a".into()));
        assert!(!window.insert("t|a".into()));
        assert!(window.insert("t|b".into()));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_trim_keeps_most_recent() {
        let mut window = DedupWindow::new(5, 2);
        for i in 0..5 {
            window.insert(format!("k{i}"));
        }
        assert_eq!(window.len(), 5);

        window.insert("k5".into());
        assert_eq!(window.len(), 2);
        assert!(window.contains("k4"));
        assert!(window.contains("k5"));
        assert!(!window.contains("k0"));
        // Beyond the horizon a key is accepted again.
        assert!(window.insert("k0".into()));
    }

    #[test]
    fn test_default_bounds_hold() {
        let mut window = DedupWindow::default();
        for i in 0..=DEFAULT_CAPACITY {
            window.insert(i.to_string());
        }
        assert_eq!(window.len(), DEFAULT_RETAIN);
        for i in 0..12_000 {
            window.insert(format!("x{i}"));
            assert!(window.len() <= DEFAULT_CAPACITY);
        }
    }
}
