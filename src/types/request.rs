use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Provider-specific options, keyed by option name.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Timeout applied by the request builders when none is given.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// The protocol shape a request is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Request/response chat completion.
    TextCompletion,
    /// Submit, then observe an asynchronous media job.
    MediaJob,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::TextCompletion => "text_completion",
            ProviderKind::MediaJob => "media_job",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single generation request.
///
/// Built once and never mutated by the orchestrator. The `deadline` bounds
/// everything done on behalf of the request: admission, every attempt, and
/// every backoff in between.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub kind: ProviderKind,
    pub prompt: String,
    pub parameters: Parameters,
    pub request_id: String,
    pub deadline: Instant,
}

impl GenerationRequest {
    /// Create a request of the given kind with a fresh id and the default timeout.
    pub fn new(kind: ProviderKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            prompt: prompt.into(),
            parameters: Parameters::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
            deadline: Instant::now() + DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Create a chat completion request.
    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(ProviderKind::TextCompletion, prompt)
    }

    /// Create a media job request.
    pub fn media(prompt: impl Into<String>) -> Self {
        Self::new(ProviderKind::MediaJob, prompt)
    }

    /// Set a parameter.
    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Replace all parameters.
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Use a caller-supplied request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    /// Set the deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Time left until the deadline (zero once it has passed).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}
