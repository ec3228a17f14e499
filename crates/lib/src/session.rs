//! Conversation sessions: one assistant thread per WhatsApp user.
//!
//! A user's first message creates a provider thread and records it in the [`ThreadStore`];
//! every later message is appended to that same thread so the assistant keeps context.

use crate::assistant::{AssistantBackend, AssistantError};
use crate::poller::CompletionPoller;
use crate::store::{StoreError, ThreadStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Provider thread id (opaque string).
pub type SessionId = String;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] AssistantError),
}

/// Resolves users to threads and runs the assistant on them.
pub struct SessionManager {
    store: Arc<ThreadStore>,
    backend: Arc<dyn AssistantBackend>,
    poller: CompletionPoller,
    /// Per-user locks held while a first thread is created.
    creating: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<ThreadStore>,
        backend: Arc<dyn AssistantBackend>,
        poller: CompletionPoller,
    ) -> Self {
        Self {
            store,
            backend,
            poller,
            creating: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.creating
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Thread for this user, creating and recording one on first contact.
    /// An existing mapping is returned as-is without checking the provider.
    pub async fn resolve_session(&self, user_id: &str) -> Result<SessionId, SessionError> {
        if let Some(id) = self.store.lookup(user_id).await? {
            log::info!("session: retrieving existing thread for {}", user_id);
            return Ok(id);
        }

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        if let Some(id) = self.store.lookup(user_id).await? {
            return Ok(id);
        }

        log::info!("session: creating new thread for {}", user_id);
        let created = self.backend.create_thread().await?;
        let mapped = self.store.insert_if_absent(user_id, &created).await?;
        if mapped != created {
            // Another process won the race; the thread we just made is left unused.
            log::warn!(
                "session: thread {} for {} is orphaned, {} was stored first",
                created,
                user_id,
                mapped
            );
        }
        Ok(mapped)
    }

    /// Append the user's text to the thread and wait for the assistant's reply.
    /// Run failures come back as an apology string, not an error.
    pub async fn append_and_generate(
        &self,
        session_id: &str,
        text: &str,
        display_name: &str,
    ) -> Result<String, SessionError> {
        self.backend.add_user_message(session_id, text).await?;
        let reply = self.poller.run(session_id).await;
        log::info!("session: generated message for {}", display_name);
        Ok(reply)
    }

    /// Resolve the user's thread, then append and generate.
    pub async fn generate_response(
        &self,
        text: &str,
        user_id: &str,
        display_name: &str,
    ) -> Result<String, SessionError> {
        let session_id = self.resolve_session(user_id).await?;
        self.append_and_generate(&session_id, text, display_name)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::testing::FakeBackend;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("threadline-session-test-{}", uuid::Uuid::new_v4()))
            .join("threads_db.json")
    }

    async fn manager(backend: Arc<FakeBackend>) -> SessionManager {
        let store = Arc::new(ThreadStore::open(temp_store_path()).await.unwrap());
        let poller = CompletionPoller::new(backend.clone(), "asst_1", Duration::from_millis(1), 10);
        SessionManager::new(store, backend, poller)
    }

    #[tokio::test]
    async fn first_contact_creates_one_thread_and_mapping() {
        let backend = Arc::new(FakeBackend::completing("hi"));
        let sessions = manager(backend.clone()).await;

        let first = sessions.resolve_session("123").await.unwrap();
        let again = sessions.resolve_session("123").await.unwrap();

        assert_eq!(first, again);
        assert_eq!(backend.threads_created.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.store().len().await.unwrap(), 1);
        assert_eq!(
            sessions.store().lookup("123").await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn different_users_get_different_threads() {
        let backend = Arc::new(FakeBackend::completing("hi"));
        let sessions = manager(backend.clone()).await;

        let john = sessions.resolve_session("123").await.unwrap();
        let sarah = sessions.resolve_session("456").await.unwrap();

        assert_ne!(john, sarah);
        assert_eq!(sessions.store().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn sequential_messages_reuse_one_thread() {
        let backend = Arc::new(FakeBackend::completing("Check-in is at 3pm."));
        let sessions = manager(backend.clone()).await;

        let r1 = sessions
            .generate_response("What's the check in time?", "123", "John")
            .await
            .unwrap();
        let r2 = sessions
            .generate_response("What was my previous question?", "123", "John")
            .await
            .unwrap();

        assert_eq!(r1, "Check-in is at 3pm.");
        assert_eq!(r2, "Check-in is at 3pm.");
        let appended = backend.appended.lock().unwrap().clone();
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[0].0, appended[1].0);
        assert_eq!(appended[1].1, "What was my previous question?");
        assert_eq!(backend.threads_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_first_contact_creates_one_thread() {
        let backend = Arc::new(FakeBackend::completing("hi"));
        let sessions = Arc::new(manager(backend.clone()).await);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let sessions = sessions.clone();
            handles.push(tokio::spawn(async move {
                sessions.resolve_session("123").await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(backend.threads_created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_leaves_no_mapping() {
        let backend = Arc::new(FakeBackend {
            fail_create_thread: true,
            ..FakeBackend::default()
        });
        let sessions = manager(backend).await;

        let err = sessions.resolve_session("123").await.unwrap_err();
        assert!(matches!(err, SessionError::Provider(_)));
        assert_eq!(sessions.store().lookup("123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_run_still_returns_a_reply() {
        let backend = Arc::new(FakeBackend::with_statuses(
            &[crate::assistant::RunStatus::Failed],
            None,
        ));
        let sessions = manager(backend).await;
        let reply = sessions.generate_response("hi", "123", "John").await.unwrap();
        assert_eq!(reply, crate::poller::FAILED_RUN_REPLY);
    }
}
