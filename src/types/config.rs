use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::coordinator::RateBudgetConfig;
use crate::retry::RetryPolicy;

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: Option<u32>,
}

/// Admission and retry limits for one provider.
#[derive(Debug, Clone)]
pub struct ProviderLimits {
    /// Maximum simultaneous calls to this provider.
    pub max_concurrency: usize,
    pub rate_budget: RateBudgetConfig,
    pub retry: RetryPolicy,
}

/// Chat completion provider settings.
#[derive(Debug, Clone)]
pub struct TextProviderSettings {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub limits: ProviderLimits,
}

impl TextProviderSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.deepseek.com/v1".to_string(),
            model: "deepseek-reasoner".to_string(),
            limits: ProviderLimits {
                max_concurrency: 4,
                rate_budget: RateBudgetConfig::per_minute(60),
                retry: RetryPolicy::text_default(),
            },
        }
    }
}

/// Intervals used while polling a job for completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollSchedule {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl PollSchedule {
    /// Interval following `current`.
    pub fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max)
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

/// Media job provider settings.
#[derive(Debug, Clone)]
pub struct MediaProviderSettings {
    pub api_key: String,
    pub queue_url: String,
    pub model: String,
    pub poll: PollSchedule,
    /// Observe jobs over the status stream before falling back to polling.
    pub use_status_stream: bool,
    pub limits: ProviderLimits,
}

impl MediaProviderSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            queue_url: "https://queue.fal.run".to_string(),
            model: "fal-ai/flux/dev".to_string(),
            poll: PollSchedule::default(),
            use_status_stream: true,
            limits: ProviderLimits {
                max_concurrency: 2,
                rate_budget: RateBudgetConfig::per_minute(30),
                retry: RetryPolicy::media_default(),
            },
        }
    }
}

/// Everything the orchestrator needs, loaded by the caller.
#[derive(Debug, Clone)]
pub struct Settings {
    pub text: Option<TextProviderSettings>,
    pub media: Option<MediaProviderSettings>,
    /// Cap on in-flight provider calls across all providers.
    pub global_max_concurrency: usize,
    /// Timeout for requests built without an explicit deadline.
    pub default_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            text: None,
            media: None,
            global_max_concurrency: 8,
            default_timeout: Duration::from_secs(120),
        }
    }
}
