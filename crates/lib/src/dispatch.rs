//! Inbound dispatcher: webhook payload in, formatted assistant reply out.
//!
//! Received -> Validated -> SessionResolved -> Generated -> Formatted -> Sent. An invalid
//! payload stops before any side effect; every valid one produces exactly one outbound send.

use crate::assistant::OpenAiAssistants;
use crate::channels::webhook;
use crate::channels::{ChannelHandle, DeliveryError, InboundMessage, WhatsAppChannel};
use crate::config::RelaySettings;
use crate::format::format_for_whatsapp;
use crate::poller::{CompletionPoller, UNAVAILABLE_REPLY};
use crate::session::SessionManager;
use crate::store::{StoreError, ThreadStore};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("payload is not a WhatsApp text message")]
    Invalid,
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Ties the session manager to an outbound channel.
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
    channel: Arc<dyn ChannelHandle>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionManager>, channel: Arc<dyn ChannelHandle>) -> Self {
        Self { sessions, channel }
    }

    /// Build the production wiring: file-backed thread store, OpenAI client, WhatsApp sender.
    pub async fn from_settings(settings: &RelaySettings) -> Result<Self, StoreError> {
        let store = Arc::new(ThreadStore::open(&settings.store_path).await?);
        let backend = Arc::new(OpenAiAssistants::new(
            Some(settings.assistant.base_url.clone()),
            settings.assistant.api_key.clone(),
        ));
        let poller = CompletionPoller::new(
            backend.clone(),
            settings.assistant.assistant_id.clone(),
            settings.assistant.poll_interval,
            settings.assistant.max_poll_attempts,
        );
        let sessions = Arc::new(SessionManager::new(store, backend, poller));
        let channel = Arc::new(WhatsAppChannel::new(&settings.channel));
        Ok(Self::new(sessions, channel))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Validate and handle one webhook payload.
    pub async fn handle(&self, payload: &serde_json::Value) -> Result<(), DispatchError> {
        let msg = webhook::extract_inbound(payload).ok_or(DispatchError::Invalid)?;
        self.handle_message(msg).await
    }

    /// Generate, format and send the reply to an already extracted message.
    pub async fn handle_message(&self, msg: InboundMessage) -> Result<(), DispatchError> {
        let reply = match self
            .sessions
            .generate_response(&msg.text, &msg.wa_id, &msg.name)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("dispatch: no reply generated for {}: {}", msg.wa_id, e);
                UNAVAILABLE_REPLY.to_string()
            }
        };
        let reply = format_for_whatsapp(&reply);
        if let Err(e) = self.channel.send_message(&msg.wa_id, &reply).await {
            log::error!(
                "dispatch: {} send to {} failed: {}",
                self.channel.id(),
                msg.wa_id,
                e
            );
            return Err(e.into());
        }
        Ok(())
    }
}
