//! WhatsApp Cloud API sender: POST {api_base}/{version}/{phone_number_id}/messages.

use crate::channels::handle::{ChannelHandle, DeliveryError};
use crate::config::ChannelSettings;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON body for a plain text message with link previews disabled.
pub fn text_message_body(recipient: &str, text: &str) -> serde_json::Value {
    json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": recipient,
        "type": "text",
        "text": { "preview_url": false, "body": text },
    })
}

/// Sends text replies through the Cloud API on behalf of one business phone number.
pub struct WhatsAppChannel {
    id: String,
    messages_url: String,
    access_token: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl WhatsAppChannel {
    pub fn new(settings: &ChannelSettings) -> Self {
        let messages_url = format!(
            "{}/{}/{}/messages",
            settings.api_base.trim_end_matches('/'),
            settings.version,
            settings.phone_number_id
        );
        Self {
            id: "whatsapp".to_string(),
            messages_url,
            access_token: settings.access_token.clone(),
            timeout: SEND_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Override the per-request timeout (default 10s).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn messages_url(&self) -> &str {
        &self.messages_url
    }

    /// Send one text message. Timeouts map to 408, every other failure to 500.
    pub async fn send_text(&self, to: &str, text: &str) -> Result<(), DeliveryError> {
        let res = self
            .client
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .timeout(self.timeout)
            .json(&text_message_body(to, text))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    log::error!("whatsapp: timeout occurred while sending message to {}", to);
                    DeliveryError::timed_out()
                } else {
                    log::error!("whatsapp: request failed: {}", e);
                    DeliveryError::failed()
                }
            })?;
        let status = res.status();
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = res.text().await.unwrap_or_default();
        if !status.is_success() {
            log::error!("whatsapp: send to {} failed: {} {}", to, status, body);
            return Err(DeliveryError::failed());
        }
        log::info!("whatsapp: message sent to {} (status {})", to, status.as_u16());
        log::debug!("whatsapp: content-type {}, body {}", content_type, body);
        Ok(())
    }
}

#[async_trait]
impl ChannelHandle for WhatsAppChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError> {
        self.send_text(conversation_id, text).await
    }
}
