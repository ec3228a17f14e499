//! Gateway: HTTP webhook endpoint for the WhatsApp Cloud API.
//!
//! Single port serves the health probe (`GET /`), the subscription handshake (`GET /webhook`)
//! and inbound events (`POST /webhook`). Messages are acknowledged immediately and answered
//! from a background processor.

mod server;

pub use server::{run_gateway, run_relay, run_relay_until, GatewayState};
