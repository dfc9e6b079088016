use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::time::{sleep_until, Instant};

/// Process-wide minimum-interval gate, keyed by upstream group.
///
/// Each grant reserves the next slot for its group while the lock is held, so
/// concurrent callers queue up one interval apart without holding the lock across
/// the wait. Groups are independent: a slow upstream never delays another.
pub struct RateLimiter {
    default_interval: Duration,
    overrides: HashMap<String, Duration>,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(default_interval: Duration) -> Self {
        Self {
            default_interval,
            overrides: HashMap::new(),
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_group_interval(mut self, group: &str, interval: Duration) -> Self {
        self.overrides.insert(group.to_string(), interval);
        self
    }

    pub fn interval_for(&self, group: &str) -> Duration {
        self.overrides
            .get(group)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Wait until `group` may issue another request. Never fails, only delays.
    pub async fn acquire(&self, group: &str) {
        let grant_at = self.reserve(group, Instant::now());
        if grant_at > Instant::now() {
            debug!(
                "rate limiter holding group {group} for {:?}",
                grant_at - Instant::now()
            );
            sleep_until(grant_at).await;
        }
    }

    fn reserve(&self, group: &str, now: Instant) -> Instant {
        let interval = self.interval_for(group);
        let mut slots = self.next_slot.lock().expect("rate limiter lock poisoned");
        let grant_at = match slots.get(group) {
            Some(next) if *next > now => *next,
            _ => now,
        };
        slots.insert(group.to_string(), grant_at + interval);
        grant_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn serializes_callers_within_a_group() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(2)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("api.example.com").await;
                Instant::now()
            }));
        }

        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap() - start);
        }
        grants.sort();

        assert_eq!(
            grants,
            vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn groups_do_not_block_each_other() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let start = Instant::now();

        limiter.acquire("slow.example.com").await;
        limiter.acquire("fast.example.com").await;

        assert_eq!(Instant::now() - start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn honours_group_overrides() {
        let limiter = RateLimiter::new(Duration::from_secs(2))
            .with_group_interval("prices", Duration::from_millis(100));
        let start = Instant::now();

        limiter.acquire("prices").await;
        limiter.acquire("prices").await;

        assert_eq!(Instant::now() - start, Duration::from_millis(100));
        assert_eq!(limiter.interval_for("other"), Duration::from_secs(2));
    }
}
