//! Assistant provider abstraction and OpenAI Assistants client.
//!
//! The relay only needs five provider calls: create a thread, append a user message,
//! start a run, poll a run, and read the newest message. Provisioning the assistant
//! itself (file upload, assistant creation) lives on [`OpenAiAssistants`] for the CLI.

mod openai;

use async_trait::async_trait;
use serde::Deserialize;

pub use openai::{NewAssistant, OpenAiAssistants};

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("assistant request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("assistant api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("assistant thread {0} has no text reply")]
    EmptyReply(String),
    #[error("reading {path}: {source}")]
    File {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle state of a run as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// True once the provider will not change the run any further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired | Self::Incomplete
        )
    }
}

/// Error detail attached to a failed run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// One generation run against a thread.
#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

/// Provider operations used by the session manager and poller.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Create an empty conversation thread; returns its id.
    async fn create_thread(&self) -> Result<String, AssistantError>;

    /// Append a user turn to the thread.
    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), AssistantError>;

    /// Start a run of `assistant_id` over the thread.
    async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, AssistantError>;

    /// Fetch the current state of a run.
    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run, AssistantError>;

    /// Text of the newest message in the thread.
    async fn latest_message_text(&self, thread_id: &str) -> Result<String, AssistantError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_parses_provider_values() {
        let run: Run = serde_json::from_str(
            r#"{"id":"run_1","status":"in_progress","object":"thread.run"}"#,
        )
        .unwrap();
        assert_eq!(run.status, RunStatus::InProgress);
        assert!(!run.status.is_terminal());
        assert!(run.last_error.is_none());
    }

    #[test]
    fn unknown_status_is_not_terminal() {
        let run: Run = serde_json::from_str(r#"{"id":"run_1","status":"thinking"}"#).unwrap();
        assert_eq!(run.status, RunStatus::Unknown);
        assert!(!run.status.is_terminal());
    }

    #[test]
    fn failed_run_carries_last_error() {
        let run: Run = serde_json::from_str(
            r#"{"id":"run_1","status":"failed","last_error":{"code":"rate_limit_exceeded","message":"slow down"}}"#,
        )
        .unwrap();
        assert!(run.status.is_terminal());
        assert_eq!(
            run.last_error.unwrap().to_string(),
            "rate_limit_exceeded: slow down"
        );
    }
}
