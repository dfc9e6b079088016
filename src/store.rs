use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::{debug, warn};

use crate::error::{AppError, Result};
use crate::series::Dataset;

pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&Arc<Dataset>) + Send + Sync>;

#[derive(Default)]
struct Topic {
    publish_lock: Mutex<()>,
    latest: RwLock<Option<Arc<Dataset>>>,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
}

impl Topic {
    /// Order guard for publishes. Stays usable after a panicking publisher.
    fn order(&self) -> MutexGuard<'_, ()> {
        self.publish_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process view of the latest dataset per source with change notification.
///
/// Publishes to one source are serialized so every subscriber observes updates in
/// publication order. Readers never block on a publish in progress for longer than
/// the pointer swap.
#[derive(Default)]
pub struct SharedStore {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let topics = self.topics.read().expect("store lock poisoned");
        f.debug_struct("SharedStore")
            .field("sources", &topics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, source: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().expect("store lock poisoned").get(source) {
            return Arc::clone(topic);
        }
        let mut topics = self.topics.write().expect("store lock poisoned");
        Arc::clone(topics.entry(source.to_string()).or_default())
    }

    /// Replace the current dataset for `source` and notify its subscribers.
    ///
    /// A panicking subscriber is logged and skipped; the remaining subscribers are
    /// still notified and the publish itself succeeds.
    pub fn publish(&self, source: &str, dataset: Dataset) -> Arc<Dataset> {
        let topic = self.topic(source);
        let dataset = Arc::new(dataset);

        let _order = topic.order();
        *topic.latest.write().expect("store lock poisoned") = Some(Arc::clone(&dataset));

        let callbacks: Vec<Callback> = topic
            .subscribers
            .lock()
            .expect("store lock poisoned")
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        debug!(
            "published {} points for {} to {} subscribers",
            dataset.len(),
            source,
            callbacks.len()
        );
        for (index, callback) in callbacks.into_iter().enumerate() {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| callback(&dataset)));
            if delivered.is_err() {
                warn!("subscriber #{} of {} panicked during notification", index + 1, source);
            }
        }
        dataset
    }

    /// Seed a dataset without notifying anyone. Used when rebuilding from storage.
    pub fn seed(&self, source: &str, dataset: Dataset) {
        let topic = self.topic(source);
        let _order = topic.order();
        *topic.latest.write().expect("store lock poisoned") = Some(Arc::new(dataset));
    }

    pub fn get(&self, source: &str) -> Result<Arc<Dataset>> {
        self.try_get(source)
            .ok_or_else(|| AppError::NotFound(source.to_string()))
    }

    pub fn try_get(&self, source: &str) -> Option<Arc<Dataset>> {
        let topics = self.topics.read().expect("store lock poisoned");
        let topic = topics.get(source)?;
        let latest = topic.latest.read().expect("store lock poisoned");
        latest.clone()
    }

    /// Register `callback` for every future publish to `source`.
    pub fn subscribe<F>(&self, source: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Arc<Dataset>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.topic(source)
            .subscribers
            .lock()
            .expect("store lock poisoned")
            .push((id, Arc::new(callback)));
        id
    }

    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, source: &str, id: SubscriptionId) -> bool {
        let topics = self.topics.read().expect("store lock poisoned");
        let Some(topic) = topics.get(source) else {
            return false;
        };
        let mut subscribers = topic.subscribers.lock().expect("store lock poisoned");
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    pub fn sources(&self) -> Vec<String> {
        let topics = self.topics.read().expect("store lock poisoned");
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, topic)| topic.latest.read().expect("store lock poisoned").is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}
