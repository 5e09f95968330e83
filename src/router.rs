//! Request dispatch: validation, admission, retries and normalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::coordinator::Coordinator;
use crate::normalizer;
use crate::provider::Adapter;
use crate::retry::RetryPolicy;
use crate::schema::ParameterSchema;
use crate::types::{
    GenerationRequest, GenerationResult, ProviderKind, ProviderMetadata, RawProviderResponse,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::Error;

struct Route {
    adapter: Adapter,
    retry: RetryPolicy,
}

/// Single entry point for generation requests.
///
/// Every call to [`Router::dispatch`] ends in exactly one [`GenerationResult`];
/// errors never cross this boundary.
pub struct Router {
    coordinator: Arc<Coordinator>,
    routes: HashMap<ProviderKind, Route>,
    schemas: HashMap<ProviderKind, ParameterSchema>,
    default_timeout: Duration,
}

impl Router {
    /// A router with the built-in parameter schemas and no adapters.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let schemas = [ProviderKind::TextCompletion, ProviderKind::MediaJob]
            .into_iter()
            .map(|kind| (kind, ParameterSchema::for_kind(kind)))
            .collect();

        Self {
            coordinator,
            routes: HashMap::new(),
            schemas,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Route requests of `kind` to `adapter`, retrying per `retry`.
    pub fn with_adapter(mut self, kind: ProviderKind, adapter: Adapter, retry: RetryPolicy) -> Self {
        self.routes.insert(kind, Route { adapter, retry });
        self
    }

    /// Replace the parameter schema for `kind`.
    pub fn with_schema(mut self, kind: ProviderKind, schema: ParameterSchema) -> Self {
        self.schemas.insert(kind, schema);
        self
    }

    /// Timeout used by [`Router::request`].
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The admission state shared by every route.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Name of the adapter serving `kind`, if any.
    pub fn adapter_name(&self, kind: ProviderKind) -> Option<&str> {
        self.routes.get(&kind).map(|route| route.adapter.name())
    }

    /// Start a request whose deadline is the router's default timeout from now.
    pub fn request(&self, kind: ProviderKind, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(kind, prompt).with_timeout(self.default_timeout)
    }

    /// Serve one request.
    #[tracing::instrument(
        name = "dispatch",
        skip(self, request),
        fields(request_id = %request.request_id, kind = %request.kind)
    )]
    pub async fn dispatch(&self, request: GenerationRequest) -> GenerationResult {
        let started = Instant::now();
        let mut metadata = ProviderMetadata::default();
        let outcome = self.run(&request, &mut metadata).await;
        metadata.latency = started.elapsed();

        let result = match outcome {
            Ok(raw) => normalizer::normalize(&request.request_id, request.kind, raw, metadata),
            Err(e) => {
                tracing::warn!(error = %e, attempts = metadata.attempts, "request failed");
                GenerationResult::failure(&request.request_id, &e, metadata)
            }
        };

        tracing::info!(
            status = ?result.status,
            attempts = result.metadata.attempts,
            latency_ms = result.metadata.latency.as_millis() as u64,
            "request finished"
        );
        result
    }

    /// Serve many requests concurrently. Results come back in input order.
    pub async fn dispatch_all(&self, requests: Vec<GenerationRequest>) -> Vec<GenerationResult> {
        join_all(requests.into_iter().map(|request| self.dispatch(request))).await
    }

    fn validate(&self, request: &GenerationRequest) -> Result<&Route, Error> {
        if request.prompt.trim().is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        if let Some(schema) = self.schemas.get(&request.kind) {
            schema.validate(&request.parameters)?;
        }
        self.routes
            .get(&request.kind)
            .ok_or_else(|| Error::validation(format!("no adapter registered for {}", request.kind)))
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        metadata: &mut ProviderMetadata,
    ) -> Result<RawProviderResponse, Error> {
        let route = self.validate(request)?;
        metadata.provider = route.adapter.name().to_string();
        let max_attempts = route.retry.max_attempts.max(1);

        loop {
            metadata.attempts += 1;
            let attempt = metadata.attempts;

            let error = match self.attempt(request, &route.adapter).await {
                Ok(raw) => return Ok(raw),
                Err(e) => e,
            };

            // A transport timeout racing the deadline is still a deadline miss.
            if error.is_transient() && Instant::now() >= request.deadline {
                return Err(Error::job_timeout(&request.request_id));
            }
            if !error.is_transient() {
                return Err(error);
            }
            if attempt >= max_attempts {
                tracing::debug!(attempt, "retries exhausted");
                return Err(error);
            }

            let delay = route
                .retry
                .delay_for(attempt - 1)
                .max(error.retry_after().unwrap_or_default());
            let overruns = Instant::now()
                .checked_add(delay)
                .map_or(true, |resume| resume >= request.deadline);
            if overruns {
                tracing::debug!(attempt, ?delay, "backoff would overrun the deadline");
                return Err(error);
            }

            tracing::info!(attempt, ?delay, error = %error, "retrying after transient error");
            metadata.retry_delays.push(delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// One admitted call to the adapter, bounded by the request deadline.
    async fn attempt(
        &self,
        request: &GenerationRequest,
        adapter: &Adapter,
    ) -> Result<RawProviderResponse, Error> {
        let permit = self
            .coordinator
            .acquire(request.kind, request.deadline)
            .await?;

        let call = adapter.invoke(&request.prompt, &request.parameters, request.remaining());
        let outcome = match tokio::time::timeout_at(request.deadline, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::job_timeout(&request.request_id)),
        };

        let snapshot = match &outcome {
            Ok(raw) => raw.rate_limit,
            Err(e) => e.rate_limit(),
        };
        if let Some(snapshot) = snapshot {
            self.coordinator.reconcile(request.kind, &snapshot);
        }
        self.coordinator.release(permit);
        outcome
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let adapters: Vec<_> = self
            .routes
            .iter()
            .map(|(kind, route)| (*kind, route.adapter.name()))
            .collect();
        f.debug_struct("Router")
            .field("adapters", &adapters)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
