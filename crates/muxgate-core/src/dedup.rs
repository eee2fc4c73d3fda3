// SPDX-License-Identifier: Apache-2.0
//! Bounded TTL set with atomic check-and-mark, used for idempotency and
//! auth-nonce replay protection.
//!
//! `CheckAndMark` must be a single atomic step — two concurrent callers
//! racing on the same key must not both observe "not present".

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

struct Entry {
    marked_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    insertion_order: Vec<String>,
}

/// A concurrency-safe, capacity- and TTL-bounded dedup set.
///
/// Entries expire `ttl` after they were last marked. When at capacity,
/// inserting a new key evicts the oldest-inserted entry first. All
/// operations are non-blocking with respect to each other (a short internal
/// mutex, never an async wait).
pub struct DedupCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                insertion_order: Vec::new(),
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Atomically check whether `key` is present (and not expired), then
    /// mark it present. Returns `true` if it was already present — i.e. this
    /// call observed a duplicate.
    pub fn check_and_mark(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("dedup cache mutex poisoned");
        let now = Instant::now();
        Self::sweep_expired(&mut inner, now, self.ttl);

        if let Some(entry) = inner.entries.get_mut(key) {
            // Still within TTL from the last mark: refresh and report duplicate.
            entry.marked_at = now;
            return true;
        }

        Self::insert(&mut inner, key.to_string(), now, self.capacity);
        false
    }

    /// Non-mutating membership check (ignoring expiry sweep side effects on
    /// other keys is fine — `check` still honors TTL for this key).
    pub fn check(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("dedup cache mutex poisoned");
        match inner.entries.get(key) {
            Some(entry) => entry.marked_at.elapsed() < self.ttl,
            None => false,
        }
    }

    /// Mark `key` present without reporting prior state.
    pub fn mark(&self, key: &str) {
        let mut inner = self.inner.lock().expect("dedup cache mutex poisoned");
        let now = Instant::now();
        Self::sweep_expired(&mut inner, now, self.ttl);
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.marked_at = now;
        } else {
            Self::insert(&mut inner, key.to_string(), now, self.capacity);
        }
    }

    /// Drop all entries. After `close`, the cache behaves as if freshly
    /// created (not actually unusable — "Close" in the spec closes backing
    /// resources, which for an in-memory cache means clearing state).
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("dedup cache mutex poisoned");
        inner.entries.clear();
        inner.insertion_order.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("dedup cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run an eviction sweep outside of `check_and_mark`/`mark`'s on-access
    /// sweep, so a cache nobody reads or writes still reclaims expired
    /// entries instead of growing stale until its next access.
    pub fn sweep_now(&self) {
        let mut inner = self.inner.lock().expect("dedup cache mutex poisoned");
        let now = Instant::now();
        Self::sweep_expired(&mut inner, now, self.ttl);
    }

    /// Spawn a background task that calls [`DedupCache::sweep_now`] every
    /// `interval`, exiting once every other `Arc` to this cache is dropped.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(&self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep_now(),
                    None => break,
                }
            }
        })
    }

    fn sweep_expired(inner: &mut Inner, now: Instant, ttl: Duration) {
        inner.entries.retain(|k, v| {
            let keep = now.duration_since(v.marked_at) < ttl;
            if !keep {
                inner.insertion_order.retain(|x| x != k);
            }
            keep
        });
    }

    fn insert(inner: &mut Inner, key: String, now: Instant, capacity: usize) {
        if inner.entries.len() >= capacity {
            // Evict the oldest-inserted entry.
            if !inner.insertion_order.is_empty() {
                let oldest = inner.insertion_order.remove(0);
                inner.entries.remove(&oldest);
            }
        }
        inner.insertion_order.push(key.clone());
        inner.entries.insert(key, Entry { marked_at: now });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_check_and_mark_is_not_duplicate() {
        let cache = DedupCache::new(16, Duration::from_secs(60));
        assert!(!cache.check_and_mark("k1"));
    }

    #[test]
    fn second_check_and_mark_is_duplicate() {
        let cache = DedupCache::new(16, Duration::from_secs(60));
        assert!(!cache.check_and_mark("k1"));
        assert!(cache.check_and_mark("k1"));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = DedupCache::new(16, Duration::from_millis(20));
        assert!(!cache.check_and_mark("k1"));
        thread::sleep(Duration::from_millis(40));
        assert!(!cache.check_and_mark("k1"), "expired entry must not be reported duplicate");
    }

    #[test]
    fn over_capacity_evicts_oldest() {
        let cache = DedupCache::new(2, Duration::from_secs(60));
        cache.check_and_mark("a");
        cache.check_and_mark("b");
        cache.check_and_mark("c"); // evicts "a"
        assert!(!cache.check("a"));
        assert!(cache.check("b"));
        assert!(cache.check("c"));
    }

    #[test]
    fn concurrent_check_and_mark_admits_exactly_one() {
        let cache = Arc::new(DedupCache::new(64, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(thread::spawn(move || cache.check_and_mark("race")));
        }
        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let first_time_count = results.iter().filter(|was_dup| !**was_dup).count();
        assert_eq!(first_time_count, 1, "exactly one racer must see a fresh key");
    }

    #[test]
    fn mark_does_not_report_state() {
        let cache = DedupCache::new(16, Duration::from_secs(60));
        cache.mark("k1");
        assert!(cache.check("k1"));
    }

    #[test]
    fn close_clears_all_entries() {
        let cache = DedupCache::new(16, Duration::from_secs(60));
        cache.check_and_mark("k1");
        cache.close();
        assert!(cache.is_empty());
        assert!(!cache.check("k1"));
    }

    #[tokio::test]
    async fn background_sweeper_evicts_an_idle_entry_without_further_access() {
        let cache = Arc::new(DedupCache::new(16, Duration::from_millis(20)));
        cache.check_and_mark("k1");
        let _sweeper = cache.clone().spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.len(), 0, "idle entry should be swept without any access");
    }

    #[tokio::test]
    async fn sweeper_stops_once_the_cache_is_dropped() {
        let cache = Arc::new(DedupCache::new(16, Duration::from_secs(60)));
        let handle = cache.clone().spawn_sweeper(Duration::from_millis(10));
        drop(cache);
        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("sweeper task should exit promptly once the cache is dropped")
            .unwrap();
    }
}
