use serde::Deserialize;

use crate::job::JobProgress;

/// Response to a queue submission.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSubmission {
    pub request_id: String,
    #[serde(default)]
    pub status_url: Option<String>,
    #[serde(default)]
    pub response_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

/// Queue state of a job as reported by the status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    InQueue,
    InProgress,
    Completed,
    Failed,
    Error,
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueLog {
    pub message: String,
}

/// Body of a status poll, and of each status stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub status: QueueState,
    #[serde(default)]
    pub queue_position: Option<u32>,
    #[serde(default)]
    pub logs: Option<Vec<QueueLog>>,
    /// Set on completed jobs whose generation failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl QueueStatus {
    pub fn progress(&self) -> JobProgress {
        JobProgress {
            queue_position: self.queue_position,
            last_log: self
                .logs
                .as_ref()
                .and_then(|logs| logs.last())
                .map(|log| log.message.clone()),
        }
    }

    /// Why the job failed, if it has.
    pub fn failure(&self) -> Option<String> {
        match (self.status, &self.error) {
            (QueueState::Completed, None) => None,
            (QueueState::Completed, Some(error)) => Some(error.clone()),
            (QueueState::Failed | QueueState::Error | QueueState::Cancelled, error) => Some(
                error
                    .clone()
                    .unwrap_or_else(|| format!("job ended with status {:?}", self.status)),
            ),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(
            self.status,
            QueueState::InQueue | QueueState::InProgress | QueueState::Unknown
        )
    }
}

/// Error body returned by the queue API.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueErrorBody {
    pub detail: serde_json::Value,
}

impl QueueErrorBody {
    pub fn message(&self) -> String {
        match &self.detail {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
