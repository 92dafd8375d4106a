//! In-memory dataset index with write-through dirty tracking.
//!
//! The cache is the source of truth for the request path: lookups never
//! fall through to the backing store, and entries are only dropped on
//! process exit. The flusher drains the dirty set in the background.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::models::dataset::AddressDataset;

pub struct CreationLock {
    pub sentinel: String,
    pub acquired_at: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// A creation for the same (address, user) pair is still running.
    Held,
}

pub struct DatasetCache {
    datasets: RwLock<HashMap<String, Arc<AddressDataset>>>,
    dirty: Mutex<HashSet<String>>,
    locks: Mutex<HashMap<String, CreationLock>>,
    lock_timeout: Duration,
    loaded: AtomicBool,
}

impl DatasetCache {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            locks: Mutex::new(HashMap::new()),
            lock_timeout,
            loaded: AtomicBool::new(false),
        }
    }

    /// Until the startup load finishes the engine answers with empty
    /// results instead of failing.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Bulk insert from the startup load; does not mark dirty.
    pub fn seed(&self, datasets: Vec<AddressDataset>) {
        let mut map = self.datasets.write().unwrap();
        for ds in datasets {
            map.insert(ds.id.clone(), Arc::new(ds));
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<AddressDataset>> {
        self.datasets.read().unwrap().get(id).cloned()
    }

    /// Snapshot of every cached dataset.
    pub fn all(&self) -> Vec<Arc<AddressDataset>> {
        self.datasets.read().unwrap().values().cloned().collect()
    }

    /// Atomic per-id write: single reference swap, then dirty.
    pub fn put(&self, dataset: AddressDataset) -> Arc<AddressDataset> {
        let id = dataset.id.clone();
        let arc = Arc::new(dataset);
        self.datasets.write().unwrap().insert(id.clone(), arc.clone());
        self.dirty.lock().unwrap().insert(id);
        arc
    }

    pub fn dirty_ids(&self) -> Vec<String> {
        self.dirty.lock().unwrap().iter().cloned().collect()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.lock().unwrap().len()
    }

    /// Clear the dirty bit only if the cache still holds exactly the
    /// flushed state; a write that raced the flush keeps the bit set.
    pub fn ack_flush(&self, id: &str, flushed: &Arc<AddressDataset>) {
        let current = self.datasets.read().unwrap().get(id).cloned();
        if let Some(current) = current {
            if Arc::ptr_eq(&current, flushed) {
                self.dirty.lock().unwrap().remove(id);
            }
        } else {
            self.dirty.lock().unwrap().remove(id);
        }
    }

    // ── Creation locks ──

    /// Protocol: reject while a younger-than-timeout lock exists;
    /// steal an expired one (previous owner presumed dead).
    pub fn try_lock(&self, key: &str) -> LockAttempt {
        let mut locks = self.locks.lock().unwrap();
        if let Some(existing) = locks.get(key) {
            if existing.acquired_at.elapsed() < self.lock_timeout {
                return LockAttempt::Held;
            }
        }
        locks.insert(
            key.to_string(),
            CreationLock {
                sentinel: uuid::Uuid::new_v4().to_string(),
                acquired_at: Instant::now(),
            },
        );
        LockAttempt::Acquired
    }

    pub fn unlock(&self, key: &str) {
        self.locks.lock().unwrap().remove(key);
    }

    /// Sweep expired locks; returns how many were evicted.
    pub fn sweep_locks(&self) -> usize {
        let mut locks = self.locks.lock().unwrap();
        let before = locks.len();
        locks.retain(|_, l| l.acquired_at.elapsed() < self.lock_timeout);
        before - locks.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Lock janitor: evicts abandoned creation locks every 5 seconds.
pub fn spawn_lock_janitor(cache: Arc<DatasetCache>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let evicted = cache.sweep_locks();
            if evicted > 0 {
                tracing::warn!("lock janitor evicted {evicted} stale creation locks");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::address::NormalizedAddress;

    fn dataset(id: &str) -> AddressDataset {
        AddressDataset {
            id: id.to_string(),
            normalized_address: NormalizedAddress::unvalidated("Hauptstraße", "1", "50667", "Köln"),
            street: "Hauptstraße".to_string(),
            house_number: "1".to_string(),
            postal: "50667".to_string(),
            city: "Köln".to_string(),
            created_by: "damian".to_string(),
            created_at: Utc::now(),
            raw_resident_data: serde_json::Value::Null,
            editable_residents: Vec::new(),
            fixed_customers: Vec::new(),
        }
    }

    #[test]
    fn put_marks_dirty_and_ack_clears() {
        let cache = DatasetCache::new(Duration::from_secs(30));
        let arc = cache.put(dataset("d1"));
        assert_eq!(cache.dirty_ids(), vec!["d1".to_string()]);
        cache.ack_flush("d1", &arc);
        assert!(cache.dirty_ids().is_empty());
    }

    #[test]
    fn ack_does_not_clear_superseded_state() {
        let cache = DatasetCache::new(Duration::from_secs(30));
        let first = cache.put(dataset("d1"));
        // a second write lands while the flusher holds `first`
        let _second = cache.put(dataset("d1"));
        cache.ack_flush("d1", &first);
        assert_eq!(cache.dirty_len(), 1);
    }

    #[test]
    fn seed_does_not_mark_dirty() {
        let cache = DatasetCache::new(Duration::from_secs(30));
        cache.seed(vec![dataset("d1"), dataset("d2")]);
        assert_eq!(cache.dirty_len(), 0);
        assert!(cache.get("d1").is_some());
    }

    #[test]
    fn lock_is_held_until_released() {
        let cache = DatasetCache::new(Duration::from_secs(30));
        assert_eq!(cache.try_lock("a:damian"), LockAttempt::Acquired);
        assert_eq!(cache.try_lock("a:damian"), LockAttempt::Held);
        // a different pair is independent
        assert_eq!(cache.try_lock("a:jens"), LockAttempt::Acquired);
        cache.unlock("a:damian");
        assert_eq!(cache.try_lock("a:damian"), LockAttempt::Acquired);
    }

    #[test]
    fn expired_lock_is_stolen() {
        let cache = DatasetCache::new(Duration::from_millis(0));
        assert_eq!(cache.try_lock("a:damian"), LockAttempt::Acquired);
        assert_eq!(cache.try_lock("a:damian"), LockAttempt::Acquired);
    }

    #[test]
    fn sweep_evicts_only_expired() {
        let cache = DatasetCache::new(Duration::from_millis(0));
        cache.try_lock("a:damian");
        assert_eq!(cache.sweep_locks(), 1);
        assert_eq!(cache.lock_count(), 0);
    }
}
