use std::time::Duration;

use rand::Rng;

use crate::config::PipelineSettings;

/// Attempt budget and exponential backoff schedule for the fetch client.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }

    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_backoff_ms),
        )
        .with_max_delay(Duration::from_millis(settings.max_backoff_ms))
        .with_jitter_ratio(settings.jitter_ratio)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Jitter above half the base step could make a later delay shorter than an earlier one.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 0.5)
        } else {
            0.0
        };
        self
    }

    pub fn jitter_ratio(&self) -> f64 {
        self.jitter_ratio
    }

    /// Delay to apply after failed attempt `attempt` (1-based), for a jitter sample in `[0, 1)`.
    ///
    /// The step doubles every attempt (`base`, `2*base`, `4*base`, ...) and the jitter adds
    /// up to `jitter_ratio` of the step, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, jitter_sample: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let step = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        let jitter = step.mul_f64(self.jitter_ratio * jitter_sample.clamp(0.0, 1.0));
        (step + jitter).min(self.max_delay)
    }

    /// `delay_for` with a random jitter sample.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::rng().random_range(0.0..1.0);
        self.delay_for(attempt, sample)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}
