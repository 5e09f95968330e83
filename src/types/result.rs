use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, ErrorKind};
use crate::types::Usage;

/// Terminal outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// What the content of a successful result represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    Binary,
}

/// A provider-hosted asset that has not been fetched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteReference {
    pub url: String,
    pub content_type: Option<String>,
    /// When the provider stops serving the asset, if it says so.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Normalized content of a successful result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    Bytes { data: Vec<u8>, content_type: String },
    Remote(RemoteReference),
}

/// Why a request failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// Diagnostics collected while serving a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderMetadata {
    /// Provider that served (or refused) the request.
    pub provider: String,
    /// Wall-clock time spent inside `dispatch`.
    pub latency: Duration,
    /// Adapter attempts made (0 when the request never reached an adapter).
    pub attempts: u32,
    /// Backoff slept before each retry, in order.
    pub retry_delays: Vec<Duration>,
    /// Id the provider assigned (completion id, job id).
    pub provider_id: Option<String>,
    pub usage: Option<Usage>,
}

impl ProviderMetadata {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Number of retries (attempts after the first).
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// The single terminal outcome of a [`GenerationRequest`](crate::GenerationRequest).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub request_id: String,
    pub status: ResultStatus,
    pub kind: Option<ContentKind>,
    pub content: Option<Content>,
    pub error: Option<FailureInfo>,
    pub metadata: ProviderMetadata,
}

impl GenerationResult {
    pub fn success(
        request_id: impl Into<String>,
        kind: ContentKind,
        content: Content,
        metadata: ProviderMetadata,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResultStatus::Success,
            kind: Some(kind),
            content: Some(content),
            error: None,
            metadata,
        }
    }

    pub fn failure(request_id: impl Into<String>, error: &Error, metadata: ProviderMetadata) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResultStatus::Failure,
            kind: None,
            content: None,
            error: Some(FailureInfo {
                kind: error.kind(),
                message: error.to_string(),
            }),
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Text content, if this is a text result.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            Some(Content::Text { text }) => Some(text),
            _ => None,
        }
    }

    /// URL of a remote asset, if this result points at one.
    pub fn remote_url(&self) -> Option<&str> {
        match &self.content {
            Some(Content::Remote(remote)) => Some(&remote.url),
            _ => None,
        }
    }
}
