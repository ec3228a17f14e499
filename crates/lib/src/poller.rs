//! Completion poller: start a run on a thread and poll it until it finishes.
//!
//! The wait is bounded by a maximum number of polls. `run` never fails; provider errors are
//! logged and replaced by a fixed apology so the user always gets an answer.

use crate::assistant::{AssistantBackend, AssistantError, RunError, RunStatus};
use std::sync::Arc;
use std::time::Duration;

/// Reply sent when the provider reports the run as failed.
pub const FAILED_RUN_REPLY: &str = "Sorry, I'm experiencing some technical difficulties.";

/// Reply sent when the provider could not be reached or never finished.
pub const UNAVAILABLE_REPLY: &str = "Sorry, I couldn't process your request at the moment.";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("run {run_id} ended as {status:?}: {detail}")]
    RunFailed {
        run_id: String,
        status: RunStatus,
        detail: String,
    },
    #[error("run {run_id} not finished after {attempts} polls")]
    TimedOut { run_id: String, attempts: u32 },
    #[error(transparent)]
    Provider(#[from] AssistantError),
}

impl GenerationError {
    /// Apology shown to the user in place of a generated reply.
    pub fn user_reply(&self) -> &'static str {
        match self {
            GenerationError::RunFailed { .. } => FAILED_RUN_REPLY,
            _ => UNAVAILABLE_REPLY,
        }
    }
}

/// Runs the configured assistant over a thread and waits for its reply.
#[derive(Clone)]
pub struct CompletionPoller {
    backend: Arc<dyn AssistantBackend>,
    assistant_id: String,
    poll_interval: Duration,
    max_attempts: u32,
}

impl CompletionPoller {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        assistant_id: impl Into<String>,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            backend,
            assistant_id: assistant_id.into(),
            poll_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Generate a reply on the thread. Failures become one of the fixed apology strings.
    pub async fn run(&self, thread_id: &str) -> String {
        match self.try_run(thread_id).await {
            Ok(text) => text,
            Err(e) => {
                log::error!("assistant run on thread {} failed: {}", thread_id, e);
                e.user_reply().to_string()
            }
        }
    }

    /// Generate a reply on the thread, reporting why it could not be produced.
    pub async fn try_run(&self, thread_id: &str) -> Result<String, GenerationError> {
        let mut run = self
            .backend
            .create_run(thread_id, &self.assistant_id)
            .await?;
        log::debug!("poller: run {} created ({:?})", run.id, run.status);

        let mut attempts = 0;
        while !run.status.is_terminal() {
            if attempts >= self.max_attempts {
                return Err(GenerationError::TimedOut {
                    run_id: run.id,
                    attempts,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            attempts += 1;
            run = self.backend.retrieve_run(thread_id, &run.id).await?;
        }

        if run.status != RunStatus::Completed {
            return Err(GenerationError::RunFailed {
                run_id: run.id,
                status: run.status,
                detail: run
                    .last_error
                    .as_ref()
                    .map(RunError::to_string)
                    .unwrap_or_else(|| "no error detail".to_string()),
            });
        }
        log::debug!("poller: run {} completed after {} poll(s)", run.id, attempts);
        Ok(self.backend.latest_message_text(thread_id).await?)
    }
}
