//! In-memory reactive cache.
//!
//! One `watch` channel per entry: writers replace the entry snapshot,
//! observers hold a receiver and wake on every change. An entry's interest
//! is the number of live receivers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;

use super::{CacheEntry, CacheKey, ReactiveCache};

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, watch::Sender<CacheEntry>>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, watch::Sender<CacheEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Observe an entry, creating it if needed. The receiver counts towards
    /// the entry's interest until dropped.
    #[must_use]
    pub fn observe(&self, key: &CacheKey) -> watch::Receiver<CacheEntry> {
        self.entries().entry(key.clone()).or_insert_with(|| watch::Sender::new(CacheEntry::default())).subscribe()
    }

    /// Current snapshot of an entry, without creating it.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries().get(key).map(|tx| tx.borrow().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl ReactiveCache for MemoryCache {
    fn get_or_create_entry(&self, key: &CacheKey) -> CacheEntry {
        self.entries()
            .entry(key.clone())
            .or_insert_with(|| watch::Sender::new(CacheEntry::default()))
            .borrow()
            .clone()
    }

    fn update_entry(&self, key: &CacheKey, value: Value) {
        let mut entries = self.entries();
        let tx = entries.entry(key.clone()).or_insert_with(|| watch::Sender::new(CacheEntry::default()));
        // `send_modify` notifies receivers and works with none attached.
        tx.send_modify(|entry| {
            entry.value = Some(value);
            entry.stale = false;
            entry.version += 1;
        });
    }

    fn update_entry_at(&self, key: &CacheKey, value: Value, version: u64) -> bool {
        let mut entries = self.entries();
        let tx = entries.entry(key.clone()).or_insert_with(|| watch::Sender::new(CacheEntry::default()));
        tx.send_if_modified(|entry| {
            if entry.version != version {
                return false;
            }
            entry.value = Some(value);
            entry.stale = false;
            entry.version += 1;
            true
        })
    }

    fn invalidate_entry(&self, key: &CacheKey) {
        if let Some(tx) = self.entries().get(key) {
            tx.send_modify(|entry| {
                entry.stale = true;
                entry.version += 1;
            });
        }
    }

    fn interest(&self, key: &CacheKey) -> usize {
        self.entries().get(key).map_or(0, watch::Sender::receiver_count)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("getUser", &json!({ "id": 1 }))
    }

    #[test]
    fn entries_are_created_on_first_access() {
        let cache = MemoryCache::new();
        assert!(cache.get(&key()).is_none());

        assert_eq!(cache.get_or_create_entry(&key()), CacheEntry::default());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_then_invalidate() {
        let cache = MemoryCache::new();

        cache.update_entry(&key(), json!({ "id": 1 }));
        let entry = cache.get(&key()).expect("entry");
        assert_eq!(entry.fresh_value(), Some(&json!({ "id": 1 })));
        assert_eq!(entry.version, 1);

        cache.invalidate_entry(&key());
        let entry = cache.get(&key()).expect("entry");
        assert!(entry.stale);
        assert_eq!(entry.fresh_value(), None);
        assert_eq!(entry.value, Some(json!({ "id": 1 })));
        assert_eq!(entry.version, 2);
    }

    #[test]
    fn versioned_update_skips_a_moved_entry() {
        let cache = MemoryCache::new();
        let started_at = cache.get_or_create_entry(&key()).version;

        cache.invalidate_entry(&key());
        assert!(!cache.update_entry_at(&key(), json!("old"), started_at));
        assert_eq!(cache.get(&key()).expect("entry").value, None);

        assert!(cache.update_entry_at(&key(), json!("new"), started_at + 1));
        assert_eq!(cache.get(&key()).expect("entry").fresh_value(), Some(&json!("new")));
    }

    #[test]
    fn invalidating_a_missing_entry_creates_nothing() {
        let cache = MemoryCache::new();
        cache.invalidate_entry(&key());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn observers_are_notified_and_counted() {
        let cache = MemoryCache::new();
        let mut rx = cache.observe(&key());
        assert_eq!(cache.interest(&key()), 1);

        cache.update_entry(&key(), json!("v1"));
        rx.changed().await.expect("changed");
        assert_eq!(rx.borrow_and_update().value, Some(json!("v1")));

        drop(rx);
        assert_eq!(cache.interest(&key()), 0);
    }
}
