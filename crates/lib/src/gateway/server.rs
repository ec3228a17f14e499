//! Gateway HTTP server: health probe and the WhatsApp webhook.

use crate::channels::webhook::{self, Verification, VerifyQuery};
use crate::channels::InboundMessage;
use crate::config::{self, Config, GatewayConfig, RelaySettings};
use crate::dispatch::Dispatcher;
use crate::init;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Shared state for the webhook and health handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub port: u16,
    pub dispatcher: Arc<Dispatcher>,
    /// Token Meta echoes during subscription setup. None rejects every handshake.
    pub verify_token: Option<String>,
    /// When set, every POST must carry a valid `X-Hub-Signature-256`.
    pub app_secret: Option<String>,
    /// Sender for validated inbound messages. The processor task receives.
    pub inbound_tx: mpsc::Sender<InboundMessage>,
}

/// Load settings from config and environment, then serve until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let settings = RelaySettings::resolve(&config)?;
    run_relay(config.gateway, settings).await
}

/// Serve the relay with already resolved settings until SIGINT/SIGTERM.
pub async fn run_relay(gateway: GatewayConfig, settings: RelaySettings) -> Result<()> {
    run_relay_until(gateway, settings, shutdown_signal()).await
}

/// Serve the relay until `shutdown` completes, then wait for in-flight replies.
pub async fn run_relay_until(
    gateway: GatewayConfig,
    settings: RelaySettings,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let bind = gateway.bind.trim();
    if !config::is_loopback_bind(bind) && settings.app_secret.is_none() {
        anyhow::bail!(
            "refusing to bind webhook to {} without signature checks (set APP_SECRET or whatsapp.appSecret)",
            bind
        );
    }
    if settings.verify_token.is_none() {
        log::warn!("no verify token configured; GET /webhook handshakes will be rejected");
    }

    let dispatcher = Arc::new(
        Dispatcher::from_settings(&settings)
            .await
            .context("opening thread store")?,
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(64);
    let processor = tokio::spawn(process_inbound(dispatcher.clone(), inbound_rx));

    let state = GatewayState {
        port: gateway.port,
        dispatcher,
        verify_token: settings.verify_token,
        app_secret: settings.app_secret,
        inbound_tx,
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route("/webhook", get(verify_webhook).post(whatsapp_webhook))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited")?;

    // The router (and every sender clone in its state) is gone; the processor drains and exits.
    if let Err(e) = processor.await {
        log::warn!("inbound processor ended abnormally: {}", e);
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Receive inbound messages and handle each on its own task so a slow run never blocks others.
async fn process_inbound(dispatcher: Arc<Dispatcher>, mut inbound_rx: mpsc::Receiver<InboundMessage>) {
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            msg = inbound_rx.recv() => {
                let Some(msg) = msg else { break };
                let dispatcher = dispatcher.clone();
                in_flight.spawn(async move {
                    let wa_id = msg.wa_id.clone();
                    match dispatcher.handle_message(msg).await {
                        Ok(()) => log::debug!("reply delivered to {}", wa_id),
                        Err(e) => log::warn!("reply to {} not delivered: {}", wa_id, e),
                    }
                });
            }
            Some(done) = in_flight.join_next(), if !in_flight.is_empty() => log_reply_task(done),
        }
    }
    if !in_flight.is_empty() {
        log::info!("waiting for {} in-flight repl(ies)", in_flight.len());
    }
    while let Some(done) = in_flight.join_next().await {
        log_reply_task(done);
    }
}

fn log_reply_task(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        log::warn!("reply task ended abnormally: {}", e);
    }
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}

fn ok_body() -> Response {
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

/// GET /webhook: Meta subscription handshake. Echoes `hub.challenge` on success.
async fn verify_webhook(
    State(state): State<GatewayState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    match webhook::verify_subscription(&query, state.verify_token.as_deref()) {
        Verification::Accepted(challenge) => {
            log::info!("webhook verified");
            (StatusCode::OK, challenge).into_response()
        }
        Verification::Forbidden => {
            log::info!("webhook verification failed");
            error_body(StatusCode::FORBIDDEN, "Verification failed")
        }
        Verification::MissingParameters => {
            log::info!("webhook verification missing parameters");
            error_body(StatusCode::BAD_REQUEST, "Missing parameters")
        }
    }
}

/// POST /webhook: checks the signature, acknowledges status updates and queues messages.
async fn whatsapp_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(ref secret) = state.app_secret {
        let provided = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !webhook::verify_signature(secret, &body, provided) {
            log::info!("webhook signature verification failed");
            return error_body(StatusCode::FORBIDDEN, "Invalid signature");
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            log::error!("failed to decode webhook JSON: {}", e);
            return error_body(StatusCode::BAD_REQUEST, "Invalid JSON provided");
        }
    };

    if webhook::is_status_update(&payload) {
        log::info!("received a WhatsApp status update");
        return ok_body();
    }

    let Some(msg) = webhook::extract_inbound(&payload) else {
        return error_body(StatusCode::NOT_FOUND, "Not a WhatsApp API event");
    };
    log::info!("message from {} queued", msg.wa_id);
    if state.inbound_tx.send(msg).await.is_err() {
        return error_body(StatusCode::SERVICE_UNAVAILABLE, "Relay is shutting down");
    }
    ok_body()
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let threads = state.dispatcher.sessions().store().len().await.ok();
    Json(json!({
        "runtime": "running",
        "port": state.port,
        "threads": threads,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::webhook::sample_payload;
    use crate::channels::WhatsAppChannel;
    use crate::config::ChannelSettings;
    use crate::poller::testing::FakeBackend;
    use crate::poller::CompletionPoller;
    use crate::session::SessionManager;
    use crate::store::ThreadStore;
    use std::time::Duration;

    async fn state(inbound_tx: mpsc::Sender<InboundMessage>) -> GatewayState {
        let path = std::env::temp_dir()
            .join(format!("threadline-server-test-{}", uuid::Uuid::new_v4()))
            .join("threads_db.json");
        let store = Arc::new(ThreadStore::open(path).await.unwrap());
        let backend = Arc::new(FakeBackend::completing("hi"));
        let poller = CompletionPoller::new(backend.clone(), "asst_1", Duration::from_millis(1), 10);
        let channel = Arc::new(WhatsAppChannel::new(&ChannelSettings {
            api_base: "http://127.0.0.1:9".to_string(),
            version: "v18.0".to_string(),
            phone_number_id: "1098765".to_string(),
            access_token: "wa-token".to_string(),
        }));
        GatewayState {
            port: 8000,
            dispatcher: Arc::new(Dispatcher::new(
                Arc::new(SessionManager::new(store, backend, poller)),
                channel,
            )),
            verify_token: None,
            app_secret: None,
            inbound_tx,
        }
    }

    fn payload_bytes() -> Bytes {
        Bytes::from(sample_payload("15550001", "John", "hi").to_string())
    }

    #[tokio::test]
    async fn valid_message_is_queued_for_the_processor() {
        let (tx, mut rx) = mpsc::channel(1);
        let res = whatsapp_webhook(State(state(tx).await), HeaderMap::new(), payload_bytes()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(rx.recv().await.unwrap().wa_id, "15550001");
    }

    #[tokio::test]
    async fn message_after_processor_stopped_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let res = whatsapp_webhook(State(state(tx).await), HeaderMap::new(), payload_bytes()).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn panicking_reply_task_is_reported_not_propagated() {
        let done: Result<(), tokio::task::JoinError> =
            tokio::spawn(async { panic!("reply task blew up") }).await;
        assert!(done.as_ref().is_err_and(|e| e.is_panic()));
        log_reply_task(done);
    }
}
