//! Meta webhook payloads: message validation, status updates, signatures and the
//! subscription handshake.

use crate::channels::InboundMessage;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

const WA_ID: &str = "/entry/0/changes/0/value/contacts/0/wa_id";
const PROFILE_NAME: &str = "/entry/0/changes/0/value/contacts/0/profile/name";
const TEXT_BODY: &str = "/entry/0/changes/0/value/messages/0/text/body";
const STATUSES: &str = "/entry/0/changes/0/value/statuses";

fn str_at<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload.pointer(pointer).and_then(Value::as_str)
}

/// Sender id, profile name and text body of the first message, when all three are present.
pub fn extract_inbound(payload: &Value) -> Option<InboundMessage> {
    Some(InboundMessage {
        wa_id: str_at(payload, WA_ID)?.to_string(),
        name: str_at(payload, PROFILE_NAME)?.to_string(),
        text: str_at(payload, TEXT_BODY)?.to_string(),
    })
}

/// True when the payload carries a text message the dispatcher can answer.
pub fn is_valid_whatsapp_message(payload: &Value) -> bool {
    extract_inbound(payload).is_some()
}

/// True for sent/delivered/read notifications. These are acknowledged and otherwise ignored.
pub fn is_status_update(payload: &Value) -> bool {
    payload
        .pointer(STATUSES)
        .and_then(Value::as_array)
        .is_some_and(|s| !s.is_empty())
}

/// Check `X-Hub-Signature-256` (`sha256=<hex>`) against HMAC-SHA256 of the raw body.
pub fn verify_signature(app_secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Query string Meta sends on `GET /webhook` when a subscription is set up.
#[derive(Debug, Default, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Outcome of the subscription handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum Verification {
    /// Echo the challenge back with 200.
    Accepted(String),
    /// Wrong mode or token.
    Forbidden,
    MissingParameters,
}

/// Decide the handshake. With no verify token configured every attempt is forbidden.
pub fn verify_subscription(query: &VerifyQuery, expected_token: Option<&str>) -> Verification {
    let (Some(mode), Some(token)) = (query.mode.as_deref(), query.verify_token.as_deref()) else {
        return Verification::MissingParameters;
    };
    let token_matches = expected_token.is_some_and(|t| constant_time_eq(token, t));
    if mode != "subscribe" || !token_matches {
        return Verification::Forbidden;
    }
    match &query.challenge {
        Some(challenge) => Verification::Accepted(challenge.clone()),
        None => Verification::MissingParameters,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) fn sample_payload(wa_id: &str, name: &str, text: &str) -> Value {
    serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "display_phone_number": "15550000", "phone_number_id": "1098765" },
                    "contacts": [{ "profile": { "name": name }, "wa_id": wa_id }],
                    "messages": [{
                        "from": wa_id,
                        "id": "wamid.abc",
                        "timestamp": "1700000000",
                        "type": "text",
                        "text": { "body": text }
                    }]
                }
            }]
        }]
    })
}
