use chrono::Utc;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use fanout_types::{CachedResult, ServiceId};

/// Per-service result cache: insertion-ordered, bounded, promote-on-read.
///
/// Reads lazily discard entries older than `max_age`; writes evict the
/// least recently used entry once a service is at `max_entries`.
pub struct ResultCache {
    entries: Vec<Mutex<LruCache<String, CachedResult>>>,
    max_age: Duration,
}

impl ResultCache {
    pub fn new(services: usize, max_entries: usize, max_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            entries: (0..services)
                .map(|_| Mutex::new(LruCache::new(capacity)))
                .collect(),
            max_age,
        }
    }

    /// Fresh entry, promoted to most recently used. Stale entries are
    /// popped on sight and reported as a miss.
    pub fn get(&self, id: ServiceId, request: &str) -> Option<CachedResult> {
        let mut cache = self.entries[id.index()].lock().unwrap();
        let age = cache.get(request)?.age_secs(Utc::now());
        if age < 0 || age as u64 > self.max_age.as_secs() {
            cache.pop(request);
            tracing::debug!("Cache: removing old result for request: {}", request);
            return None;
        }
        tracing::debug!(
            "Cache: result for request: {}, service_id: {} found",
            request,
            id
        );
        cache.get(request).cloned()
    }

    /// Timestamps and stores the output, returning the entry that was
    /// written so callers can hand the exact cached shape back.
    pub fn save(&self, id: ServiceId, request: &str, output: Value) -> CachedResult {
        let entry = CachedResult::new(output);
        self.entries[id.index()]
            .lock()
            .unwrap()
            .push(request.to_string(), entry.clone());
        entry
    }

    pub fn len(&self, id: ServiceId) -> usize {
        self.entries[id.index()].lock().unwrap().len()
    }

    pub fn is_empty(&self, id: ServiceId) -> bool {
        self.len(id) == 0
    }

    /// Drops every cached result for every service.
    pub fn clear(&self) {
        for cache in &self.entries {
            cache.lock().unwrap().clear();
        }
    }
}
