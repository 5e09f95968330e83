//! Backoff policy for the router's retry loop.

use std::time::Duration;

use rand::Rng;

/// How many times, and how far apart, a transient failure is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the random extra delay, as a fraction of the base delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Three attempts for request/response providers.
    pub fn text_default() -> Self {
        Self::default()
    }

    /// One resubmission for job providers; resubmitting costs a full generation.
    pub fn media_default() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Jitter stays below `multiplier - 1` so uncapped delays keep growing.
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Base delay before retry number `retry` (0-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.min(31) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Delay before retry number `retry` (0-based), with jitter, capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter_cap = base.as_millis() as f64 * self.jitter_factor;
        let jitter = if jitter_cap >= 1.0 {
            rand::thread_rng().gen_range(0.0..jitter_cap)
        } else {
            0.0
        };
        (base + Duration::from_millis(jitter as u64)).min(self.max_delay)
    }
}
