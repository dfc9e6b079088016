use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;

use super::RawResponse;

struct Entry {
    response: RawResponse,
    expires_at: Instant,
}

/// Short-lived in-memory cache of successful responses keyed by rendered URL.
///
/// Bounded by `capacity`; the least recently used entry is evicted first.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, Entry>>,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, url: &str) -> Option<RawResponse> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get(url) {
            if Instant::now() < entry.expires_at {
                return Some(RawResponse {
                    from_cache: true,
                    ..entry.response.clone()
                });
            }
        }
        entries.pop(url);
        None
    }

    pub fn insert(&self, url: &str, response: &RawResponse) {
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.put(
            url.to_string(),
            Entry {
                response: response.clone(),
                expires_at,
            },
        );
    }

    /// Drop stale entries and return how many were removed.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(url, _)| url.clone())
            .collect();
        for url in &stale {
            entries.pop(url);
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
