//! WhatsApp channel: webhook payload parsing and the Cloud API sender.
//!
//! Inbound messages arrive as webhook POSTs and are validated here before the dispatcher
//! handles them. Replies go out through a [`ChannelHandle`].

mod handle;
mod inbound;
pub mod webhook;
mod whatsapp;

pub use handle::{ChannelHandle, DeliveryError};
pub use inbound::InboundMessage;
pub use whatsapp::{text_message_body, WhatsAppChannel};
