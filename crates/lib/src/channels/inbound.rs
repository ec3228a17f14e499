//! Inbound message from WhatsApp: delivered to the dispatcher for session/assistant handling.

/// A text message extracted from a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Sender's WhatsApp id (also the reply recipient).
    pub wa_id: String,
    /// Sender's profile name.
    pub name: String,
    pub text: String,
}
