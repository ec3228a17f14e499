//! Outbound seam: anything that can deliver a text reply to a conversation.

use async_trait::async_trait;
use serde_json::json;

/// Why a reply could not be delivered, as an HTTP-style status and message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed ({status}): {message}")]
pub struct DeliveryError {
    pub status: u16,
    pub message: String,
}

impl DeliveryError {
    pub fn timed_out() -> Self {
        Self {
            status: 408,
            message: "Request timed out".to_string(),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: 500,
            message: "Failed to send message".to_string(),
        }
    }

    /// JSON error body reported to whoever invoked the send.
    pub fn body(&self) -> serde_json::Value {
        json!({ "status": "error", "message": self.message })
    }
}

/// Handle to an outbound channel.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "whatsapp").
    fn id(&self) -> &str;
    /// Send a text message to a conversation (for WhatsApp, the recipient's wa_id).
    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), DeliveryError>;
}
