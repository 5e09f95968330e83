use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::RateLimitSnapshot;

/// Errors that can occur while orchestrating a generation.
///
/// Everything below the router is expressed with this type; the router is the
/// only place that turns it into a failed [`GenerationResult`](crate::GenerationResult).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Transient provider error: {provider} - {message}")]
    TransientProvider {
        provider: String,
        message: String,
        retry_after: Option<Duration>,
        rate_limit: Option<RateLimitSnapshot>,
    },

    #[error("Provider error: {provider} - {message}")]
    PermanentProvider {
        provider: String,
        message: String,
        rate_limit: Option<RateLimitSnapshot>,
    },

    #[error("Job {job_id} did not finish before the deadline")]
    JobTimeout { job_id: String },

    #[error("No admission for {provider} before the deadline")]
    AdmissionTimeout { provider: String },

    #[error("Unexpected provider payload: {0}")]
    Normalization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Classified error kinds surfaced on failed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    TransientProviderError,
    PermanentProviderError,
    JobTimeout,
    AdmissionTimeout,
    NormalizationError,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransientProvider {
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
            rate_limit: None,
        }
    }

    pub fn transient_with_retry_after(
        provider: impl Into<String>,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Error::TransientProvider {
            provider: provider.into(),
            message: message.into(),
            retry_after,
            rate_limit: None,
        }
    }

    pub fn permanent(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::PermanentProvider {
            provider: provider.into(),
            message: message.into(),
            rate_limit: None,
        }
    }

    pub fn job_timeout(job_id: impl Into<String>) -> Self {
        Error::JobTimeout {
            job_id: job_id.into(),
        }
    }

    pub fn admission_timeout(provider: impl Into<String>) -> Self {
        Error::AdmissionTimeout {
            provider: provider.into(),
        }
    }

    pub fn normalization(message: impl Into<String>) -> Self {
        Error::Normalization(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Classify an HTTP status returned by a provider.
    pub fn from_status(
        provider: &str,
        status: reqwest::StatusCode,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = format!("HTTP {}: {}", status.as_u16(), message.into());
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            Error::transient_with_retry_after(provider, message, retry_after)
        } else {
            Error::permanent(provider, message)
        }
    }

    /// Attach the rate-limit headers of the failed response.
    pub fn with_rate_limit(mut self, snapshot: RateLimitSnapshot) -> Self {
        if let Error::TransientProvider { rate_limit, .. } | Error::PermanentProvider { rate_limit, .. } =
            &mut self
        {
            *rate_limit = (!snapshot.is_empty()).then_some(snapshot);
        }
        self
    }

    /// Rate-limit state the provider reported with this error.
    pub fn rate_limit(&self) -> Option<RateLimitSnapshot> {
        match self {
            Error::TransientProvider { rate_limit, .. } | Error::PermanentProvider { rate_limit, .. } => {
                *rate_limit
            }
            _ => None,
        }
    }

    /// The taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::Config(_) => ErrorKind::ValidationError,
            Error::TransientProvider { .. } => ErrorKind::TransientProviderError,
            Error::PermanentProvider { .. } => ErrorKind::PermanentProviderError,
            Error::JobTimeout { .. } => ErrorKind::JobTimeout,
            Error::AdmissionTimeout { .. } => ErrorKind::AdmissionTimeout,
            Error::Normalization(_) | Error::Serialization(_) => ErrorKind::NormalizationError,
            Error::Http(e) => {
                if e.is_decode() {
                    ErrorKind::NormalizationError
                } else if e.is_builder() {
                    ErrorKind::ValidationError
                } else if let Some(status) = e.status() {
                    if status.as_u16() == 429 || status.as_u16() == 408 || status.is_server_error()
                    {
                        ErrorKind::TransientProviderError
                    } else {
                        ErrorKind::PermanentProviderError
                    }
                } else {
                    // timeouts, refused connections, resets
                    ErrorKind::TransientProviderError
                }
            }
        }
    }

    /// Whether the router may retry the call that produced this error.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientProviderError
    }

    /// Provider-requested minimum wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::TransientProvider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
