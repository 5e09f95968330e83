use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{Map, Value};

use super::types::{QueueErrorBody, QueueStatus, QueueSubmission};
use crate::job::{JobHandle, JobState, ProviderJob};
use crate::provider::JobProvider;
use crate::providers::http::{classify_transport, rate_limit_snapshot, retry_after};
use crate::sse_stream::SseStreamExt;
use crate::types::{MediaProviderSettings, Parameters, PollSchedule, RawProviderResponse};
use crate::Error;

/// Endpoints of one queued job.
#[derive(Debug, Clone)]
struct JobUrls {
    status: String,
    response: String,
    cancel: String,
}

#[derive(Debug)]
struct TrackedJob {
    job: ProviderJob,
    urls: JobUrls,
}

/// fal.ai queue provider.
///
/// Jobs are observed over the status stream first. If the stream cannot be
/// opened or drops before a terminal status, the same job is polled until
/// it finishes; it is never resubmitted.
pub struct FalProvider {
    client: Client,
    name: String,
    api_key: String,
    queue_url: String,
    model: String,
    poll: PollSchedule,
    use_status_stream: bool,
    jobs: Mutex<HashMap<String, TrackedJob>>,
}

impl FalProvider {
    pub fn new(api_key: String) -> Result<Self, Error> {
        Self::new_with_base_url(api_key, "https://queue.fal.run".to_string())
    }

    /// Create a provider against a custom queue URL.
    pub fn new_with_base_url(api_key: String, queue_url: String) -> Result<Self, Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            name: "fal".to_string(),
            api_key,
            queue_url: queue_url.trim_end_matches('/').to_string(),
            model: "fal-ai/flux/dev".to_string(),
            poll: PollSchedule::default(),
            use_status_stream: true,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &MediaProviderSettings) -> Result<Self, Error> {
        if settings.api_key.is_empty() {
            return Err(Error::config("API key required for the media provider"));
        }
        Ok(
            Self::new_with_base_url(settings.api_key.clone(), settings.queue_url.clone())?
                .with_model(settings.model.clone())
                .with_poll_schedule(settings.poll)
                .with_status_stream(settings.use_status_stream),
        )
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_poll_schedule(mut self, poll: PollSchedule) -> Self {
        self.poll = poll;
        self
    }

    /// Disable to poll from the start.
    pub fn with_status_stream(mut self, enabled: bool) -> Self {
        self.use_status_stream = enabled;
        self
    }

    /// Jobs submitted and not yet in a terminal state.
    pub fn active_jobs(&self) -> usize {
        self.jobs().len()
    }

    /// State of a tracked job.
    pub fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.jobs().get(job_id).map(|tracked| tracked.job.state())
    }

    /// Ask the queue to cancel a job. Best effort: the job still has to be
    /// awaited to learn how it ended.
    pub async fn cancel(&self, handle: &JobHandle) -> Result<(), Error> {
        let urls = self.urls(handle.job_id())?;
        let response = self
            .client
            .put(&urls.cancel)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }
        tracing::info!(job_id = handle.job_id(), "cancellation requested");
        Ok(())
    }

    fn auth(&self) -> String {
        format!("Key {}", self.api_key)
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn urls(&self, job_id: &str) -> Result<JobUrls, Error> {
        self.jobs()
            .get(job_id)
            .map(|tracked| tracked.urls.clone())
            .ok_or_else(|| Error::validation(format!("unknown job '{job_id}'")))
    }

    fn transition(&self, job_id: &str, state: JobState) {
        if let Some(tracked) = self.jobs().get_mut(job_id) {
            tracked.job.advance(state);
        }
    }

    fn record(&self, job_id: &str, status: &QueueStatus) {
        if let Some(tracked) = self.jobs().get_mut(job_id) {
            tracked.job.observe(status.progress());
            tracing::trace!(
                job_id,
                status = ?status.status,
                queue_position = ?status.queue_position,
                "job status"
            );
        }
    }

    /// Move a job to its terminal state, stop tracking it and deliver its outcome.
    fn retire(
        &self,
        job_id: &str,
        state: JobState,
        outcome: Result<RawProviderResponse, Error>,
    ) -> Result<RawProviderResponse, Error> {
        let Some(mut tracked) = self.jobs().remove(job_id) else {
            return outcome;
        };
        tracked.job.finish(state, outcome);
        let error = tracked
            .job
            .outcome()
            .and_then(|outcome| outcome.as_ref().err())
            .map(ToString::to_string);
        tracing::debug!(
            job_id,
            state = ?tracked.job.state(),
            observations = tracked.job.attempts,
            queue_position = ?tracked.job.progress.queue_position,
            error = error.as_deref(),
            "job finished"
        );
        tracked
            .job
            .deliver()
            .unwrap_or_else(|| Err(Error::job_timeout(job_id)))
    }

    fn default_urls(&self, model: &str, job_id: &str) -> JobUrls {
        let base = format!("{}/{}/requests/{}", self.queue_url, model, job_id);
        JobUrls {
            status: format!("{base}/status"),
            cancel: format!("{base}/cancel"),
            response: base,
        }
    }

    async fn error_from_response(&self, response: reqwest::Response) -> Error {
        let status = response.status();
        let retry_after = retry_after(response.headers());
        let snapshot = rate_limit_snapshot(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<QueueErrorBody>(&body) {
            Ok(error) => error.message(),
            Err(_) if body.is_empty() => status.canonical_reason().unwrap_or("no body").to_string(),
            Err(_) => body,
        };
        Error::from_status(&self.name, status, message, retry_after).with_rate_limit(snapshot)
    }

    async fn observe(&self, job_id: &str, urls: &JobUrls) -> Result<RawProviderResponse, Error> {
        if self.use_status_stream {
            match self.stream_status(job_id, urls).await {
                Ok(Some(status)) => {
                    if let Some(reason) = status.failure() {
                        return Err(Error::permanent(&self.name, reason));
                    }
                    match self.fetch_result(job_id, urls).await {
                        Ok(raw) => return Ok(raw),
                        Err(e) if e.is_transient() => {
                            tracing::warn!(job_id, error = %e, "result fetch failed, polling");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(None) => {
                    tracing::info!(job_id, "status stream ended early, falling back to polling");
                }
                Err(e) => {
                    tracing::info!(job_id, error = %e, "status stream unavailable, falling back to polling");
                }
            }
        }
        self.poll_status(job_id, urls).await
    }

    /// Follow the status stream. `None` means it ended before a terminal status.
    async fn stream_status(&self, job_id: &str, urls: &JobUrls) -> Result<Option<QueueStatus>, Error> {
        let response = self
            .client
            .get(format!("{}/stream", urls.status))
            .query(&[("logs", "1")])
            .header("Authorization", self.auth())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }
        self.transition(job_id, JobState::Streaming);

        let mut events = Box::pin(response.bytes_stream()).sse_events();
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(job_id, error = %e, "status stream interrupted");
                    return Ok(None);
                }
            };
            let status: QueueStatus = match serde_json::from_str(&event.data) {
                Ok(status) => status,
                Err(e) => {
                    tracing::debug!(job_id, error = %e, "skipping unreadable status event");
                    continue;
                }
            };
            self.record(job_id, &status);
            if status.is_terminal() {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    async fn poll_status(&self, job_id: &str, urls: &JobUrls) -> Result<RawProviderResponse, Error> {
        self.transition(job_id, JobState::Polling);
        let mut interval = self.poll.initial;

        loop {
            match self.fetch_status(urls).await {
                Ok(status) => {
                    self.record(job_id, &status);
                    if let Some(reason) = status.failure() {
                        return Err(Error::permanent(&self.name, reason));
                    }
                    if status.is_terminal() {
                        match self.fetch_result(job_id, urls).await {
                            Ok(raw) => return Ok(raw),
                            Err(e) if e.is_transient() => {
                                tracing::warn!(job_id, error = %e, "result fetch failed, retrying");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(job_id, error = %e, "status poll failed, retrying");
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(interval).await;
            interval = self.poll.next(interval);
        }
    }

    async fn fetch_status(&self, urls: &JobUrls) -> Result<QueueStatus, Error> {
        let response = self
            .client
            .get(&urls.status)
            .query(&[("logs", "1")])
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }
        response
            .json()
            .await
            .map_err(|e| Error::transient(&self.name, format!("unreadable status: {e}")))
    }

    async fn fetch_result(&self, job_id: &str, urls: &JobUrls) -> Result<RawProviderResponse, Error> {
        let response = self
            .client
            .get(&urls.response)
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        let raw = if content_type.starts_with("application/json") {
            let body: Value = response
                .json()
                .await
                .map_err(|e| Error::normalization(format!("{} returned an undecodable result: {e}", self.name)))?;
            RawProviderResponse::json(self.name.clone(), body)
        } else {
            let data = response
                .bytes()
                .await
                .map_err(|e| classify_transport(&self.name, e))?;
            RawProviderResponse::bytes(self.name.clone(), data.to_vec(), content_type)
        };
        Ok(raw.with_provider_id(job_id))
    }
}

/// Marks a job timed out if its wait is dropped before it finished.
struct Abandoned<'a> {
    provider: &'a FalProvider,
    job_id: &'a str,
    armed: bool,
}

impl Drop for Abandoned<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.provider.retire(
                self.job_id,
                JobState::TimedOut,
                Err(Error::job_timeout(self.job_id)),
            );
        }
    }
}

#[async_trait::async_trait]
impl JobProvider for FalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, payload: &str, parameters: &Parameters) -> Result<JobHandle, Error> {
        let model = parameters
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&self.model)
            .to_string();

        let mut body: Map<String, Value> = parameters
            .iter()
            .filter(|(name, _)| name.as_str() != "model")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        body.insert("prompt".to_string(), Value::String(payload.to_string()));

        let response = self
            .client
            .post(format!("{}/{}", self.queue_url, model))
            .header("Authorization", self.auth())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&self.name, e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let submission: QueueSubmission = response
            .json()
            .await
            .map_err(|e| Error::transient(&self.name, format!("unreadable submission response: {e}")))?;

        let defaults = self.default_urls(&model, &submission.request_id);
        let urls = JobUrls {
            status: submission.status_url.unwrap_or(defaults.status),
            response: submission.response_url.unwrap_or(defaults.response),
            cancel: submission.cancel_url.unwrap_or(defaults.cancel),
        };

        let (job, handle) = ProviderJob::submitted(submission.request_id.clone());
        self.jobs()
            .insert(submission.request_id.clone(), TrackedJob { job, urls });
        tracing::info!(job_id = %submission.request_id, %model, "job queued");
        Ok(handle)
    }

    async fn await_completion(
        &self,
        handle: &JobHandle,
        timeout: Duration,
    ) -> Result<RawProviderResponse, Error> {
        let job_id = handle.job_id();
        let urls = self.urls(job_id)?;
        let mut guard = Abandoned {
            provider: self,
            job_id,
            armed: true,
        };

        let observed = tokio::time::timeout(timeout, self.observe(job_id, &urls)).await;
        guard.armed = false;

        let (state, outcome) = match observed {
            Ok(Ok(raw)) => (JobState::Completed, Ok(raw)),
            Ok(Err(e)) => (JobState::Failed, Err(e)),
            Err(_) => {
                tracing::warn!(job_id, ?timeout, "job did not finish in time");
                (JobState::TimedOut, Err(Error::job_timeout(job_id)))
            }
        };
        self.retire(job_id, state, outcome)
    }
}
