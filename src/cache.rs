//! Bounded in-memory caches.
//!
//! [`TimedLru`] is one cache segment: least-recently-used eviction bounded
//! by entry count, plus per-entry expiry by age. Each client owns its own
//! segments (`http`, `posts`, `media`, `similarity`), configured
//! independently through [`CacheSegmentConfig`].
//!
//! [`RevisionSlot`] holds one parsed value per revision, for tables that
//! are expensive to rebuild from JSON on every call.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheSegmentConfig;

/// LRU cache with a maximum entry age.
///
/// Reads refresh recency but not age: an entry expires `max_age` after it
/// was inserted, however often it is read.
pub struct TimedLru<V> {
    entries: Mutex<LruCache<String, (Instant, V)>>,
    max_age: Duration,
}

impl<V: Clone> TimedLru<V> {
    pub fn new(max_entries: usize, max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            max_age,
        }
    }

    pub fn from_config(config: &CacheSegmentConfig) -> Self {
        Self::new(config.max_entries, config.max_age())
    }

    /// Returns a fresh entry and marks it most recently used. Expired
    /// entries are removed on the way.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((inserted, value)) => {
                if inserted.elapsed() < self.max_age {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    /// Insert or replace; evicts the least recently used entry when full.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.lock().put(key.into(), (Instant::now(), value));
    }

    /// Whether a fresh entry exists, without touching recency.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|(inserted, _)| inserted.elapsed() < self.max_age)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.lock().pop(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// One value per revision; storing a value for a new revision replaces
/// the previous one.
pub struct RevisionSlot<T> {
    slot: Mutex<Option<(String, Arc<T>)>>,
}

impl<T> RevisionSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get(&self, revision: &str) -> Option<Arc<T>> {
        match &*self.slot.lock() {
            Some((rev, value)) if rev == revision => Some(Arc::clone(value)),
            _ => None,
        }
    }

    pub fn set(&self, revision: &str, value: Arc<T>) {
        *self.slot.lock() = Some((revision.to_string(), value));
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

impl<T> Default for RevisionSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = TimedLru::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);

        // touch "a" so "b" becomes the oldest untouched entry
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("b"), None, "untouched entry should be evicted");
        assert_eq!(cache.get("a"), Some(1), "recently read entry survives");
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_expired_entries_are_dropped() {
        let cache = TimedLru::new(10, Duration::ZERO);
        cache.insert("a", 1);
        assert!(!cache.contains("a"));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = TimedLru::new(0, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(1));
    }

    #[test]
    fn test_clear_and_remove() {
        let cache = TimedLru::new(4, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.remove("a"), Some(1));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_revision_slot_partitions_by_revision() {
        let slot = RevisionSlot::new();
        slot.set("r1", Arc::new(vec![1]));
        assert_eq!(slot.get("r1").as_deref(), Some(&vec![1]));
        assert!(slot.get("r2").is_none());

        slot.set("r2", Arc::new(vec![2]));
        assert!(slot.get("r1").is_none());
        slot.clear();
        assert!(slot.get("r2").is_none());
    }
}
