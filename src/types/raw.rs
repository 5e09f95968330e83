use std::time::Duration;

/// Rate-limit state reported by a provider alongside a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Requests the provider will still accept in the current window.
    pub remaining: Option<u32>,
    /// Time until the provider's window resets.
    pub reset_after: Option<Duration>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.reset_after.is_none()
    }
}

/// Body of a provider response, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Json(serde_json::Value),
    Bytes { data: Vec<u8>, content_type: String },
}

/// What an adapter hands back to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct RawProviderResponse {
    pub provider: String,
    /// Completion id or job id.
    pub provider_id: Option<String>,
    pub payload: RawPayload,
    pub rate_limit: Option<RateLimitSnapshot>,
}

impl RawProviderResponse {
    pub fn json(provider: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            provider: provider.into(),
            provider_id: None,
            payload: RawPayload::Json(body),
            rate_limit: None,
        }
    }

    pub fn bytes(
        provider: impl Into<String>,
        data: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            provider_id: None,
            payload: RawPayload::Bytes {
                data,
                content_type: content_type.into(),
            },
            rate_limit: None,
        }
    }

    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_id = Some(id.into());
        self
    }

    pub fn with_rate_limit(mut self, snapshot: RateLimitSnapshot) -> Self {
        if !snapshot.is_empty() {
            self.rate_limit = Some(snapshot);
        }
        self
    }
}
