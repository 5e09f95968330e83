use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::job::JobHandle;
use crate::types::{Parameters, RawProviderResponse};
use crate::Error;

/// A provider answering each call in a single request/response round trip.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync + 'static {
    /// Name used in logs, errors and result metadata.
    fn name(&self) -> &str;

    /// Run one completion, bounded by `timeout`.
    async fn complete(
        &self,
        prompt: &str,
        parameters: &Parameters,
        timeout: Duration,
    ) -> Result<RawProviderResponse, Error>;
}

/// A provider that accepts jobs and completes them asynchronously.
#[async_trait::async_trait]
pub trait JobProvider: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Submit a job and return a handle to it.
    async fn submit(&self, payload: &str, parameters: &Parameters) -> Result<JobHandle, Error>;

    /// Wait for a submitted job to reach a terminal state.
    ///
    /// Fails with [`Error::JobTimeout`] once `timeout` elapses.
    async fn await_completion(
        &self,
        handle: &JobHandle,
        timeout: Duration,
    ) -> Result<RawProviderResponse, Error>;
}

/// The two protocol shapes the router knows how to drive.
#[derive(Clone)]
pub enum Adapter {
    RequestResponse(Arc<dyn CompletionProvider>),
    SubmitAndAwait(Arc<dyn JobProvider>),
}

impl Adapter {
    pub fn request_response(provider: impl CompletionProvider) -> Self {
        Adapter::RequestResponse(Arc::new(provider))
    }

    pub fn submit_and_await(provider: impl JobProvider) -> Self {
        Adapter::SubmitAndAwait(Arc::new(provider))
    }

    pub fn name(&self) -> &str {
        match self {
            Adapter::RequestResponse(provider) => provider.name(),
            Adapter::SubmitAndAwait(provider) => provider.name(),
        }
    }

    /// Run one attempt against the provider, whatever its protocol.
    pub async fn invoke(
        &self,
        prompt: &str,
        parameters: &Parameters,
        timeout: Duration,
    ) -> Result<RawProviderResponse, Error> {
        match self {
            Adapter::RequestResponse(provider) => provider.complete(prompt, parameters, timeout).await,
            Adapter::SubmitAndAwait(provider) => {
                let deadline = Instant::now() + timeout;
                let handle = provider.submit(prompt, parameters).await?;
                tracing::debug!(provider = provider.name(), job_id = handle.job_id(), "job submitted");
                let remaining = deadline.saturating_duration_since(Instant::now());
                provider.await_completion(&handle, remaining).await
            }
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Adapter::RequestResponse(p) => f.debug_tuple("RequestResponse").field(&p.name()).finish(),
            Adapter::SubmitAndAwait(p) => f.debug_tuple("SubmitAndAwait").field(&p.name()).finish(),
        }
    }
}
