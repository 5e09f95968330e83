//! Lifecycle of a provider-side asynchronous job.

use serde::Serialize;
use tokio::sync::watch;

use crate::types::RawProviderResponse;
use crate::Error;

/// Where a job is in its lifecycle.
///
/// `Polling` and `Streaming` may alternate; `Completed`, `Failed` and
/// `TimedOut` are terminal and absorb every later transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Polling,
    Streaming,
    Completed,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::TimedOut
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Submitted) => false,
            (Submitted | Polling | Streaming, _) => true,
            _ => false,
        }
    }
}

/// Progress last reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub queue_position: Option<u32>,
    pub last_log: Option<String>,
}

/// A submitted job as tracked by the adapter that owns it.
#[derive(Debug)]
pub struct ProviderJob {
    pub job_id: String,
    state: JobState,
    /// Status observations made so far.
    pub attempts: u32,
    pub progress: JobProgress,
    outcome: Option<Result<RawProviderResponse, Error>>,
    notifier: watch::Sender<JobState>,
}

impl ProviderJob {
    /// Start tracking a freshly submitted job.
    pub fn submitted(job_id: impl Into<String>) -> (Self, JobHandle) {
        let job_id = job_id.into();
        let (notifier, receiver) = watch::channel(JobState::Submitted);
        let job = Self {
            job_id: job_id.clone(),
            state: JobState::Submitted,
            attempts: 0,
            progress: JobProgress::default(),
            outcome: None,
            notifier,
        };
        (job, JobHandle { job_id, receiver })
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` and leaves the state alone otherwise.
    pub fn advance(&mut self, next: JobState) -> bool {
        if self.state == next && !next.is_terminal() {
            return true;
        }
        if !self.state.can_advance_to(next) {
            tracing::debug!(job_id = %self.job_id, from = ?self.state, to = ?next, "ignoring job transition");
            return false;
        }
        self.state = next;
        self.notifier.send_replace(next);
        true
    }

    /// Enter a terminal state and keep the result or error for delivery.
    ///
    /// A job that already finished keeps its first outcome.
    pub fn finish(&mut self, state: JobState, outcome: Result<RawProviderResponse, Error>) {
        if self.outcome.is_none() && self.advance(state) {
            self.outcome = Some(outcome);
        }
    }

    pub fn outcome(&self) -> Option<&Result<RawProviderResponse, Error>> {
        self.outcome.as_ref()
    }

    /// Hand the outcome to the caller, ending the job record.
    pub fn deliver(self) -> Option<Result<RawProviderResponse, Error>> {
        self.outcome
    }

    /// Record a status observation.
    pub fn observe(&mut self, progress: JobProgress) {
        self.attempts += 1;
        if progress.queue_position.is_some() {
            self.progress.queue_position = progress.queue_position;
        }
        if progress.last_log.is_some() {
            self.progress.last_log = progress.last_log;
        }
    }
}

/// Caller-side handle to a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: String,
    receiver: watch::Receiver<JobState>,
}

impl JobHandle {
    /// A handle for a job not tracked by any table; its state stays `Submitted`.
    pub fn detached(job_id: impl Into<String>) -> Self {
        let (_, receiver) = watch::channel(JobState::Submitted);
        Self {
            job_id: job_id.into(),
            receiver,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The last state published for this job.
    pub fn state(&self) -> JobState {
        *self.receiver.borrow()
    }

    /// Receive every state change of the job.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.receiver.clone()
    }
}
