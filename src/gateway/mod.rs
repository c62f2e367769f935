//! C7 — HTTP gateway: cron CRUD/trigger surface plus a WebSocket event
//! feed for observability.
//!
//! Starts by default; set `CONDUCTOR_GATEWAY=0` to disable. Serves:
//! - `GET /api/status`, `/api/health`
//! - `GET/POST/PATCH/DELETE /api/cron[/:name]`, `POST /api/trigger/:name`,
//!   `GET /api/cron/:name/history`
//! - `GET/PUT /api/config`
//! - `GET /ws` — WebSocket: broadcasts internal events to clients;
//!   client messages are forwarded to a commands channel.

mod auth;
mod handlers;
mod ws;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::scheduler::SchedulerHandle;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Global senders (so other modules can publish events / send commands)
// ---------------------------------------------------------------------------

static GLOBAL_EVENTS_TX: OnceLock<broadcast::Sender<String>> = OnceLock::new();

/// Store the gateway broadcast sender so other modules can publish events.
pub fn set_global_events_tx(tx: broadcast::Sender<String>) {
    let _ = GLOBAL_EVENTS_TX.set(tx);
}

/// Retrieve the global events sender (if the gateway is running).
pub fn global_events_tx() -> Option<broadcast::Sender<String>> {
    GLOBAL_EVENTS_TX.get().cloned()
}

/// Serialize `value` as JSON and broadcast it to all WebSocket clients.
///
/// No-op if the gateway is not running.
pub fn publish_event_json(value: &serde_json::Value) {
    if let Some(tx) = global_events_tx() {
        match serde_json::to_string(value) {
            Ok(json) => {
                // Best-effort: ignore send errors (e.g. no active receivers).
                let _ = tx.send(json);
            }
            Err(e) => {
                warn!(error = %e, "gateway: failed to serialize event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ChannelConnector for gateway replies
// ---------------------------------------------------------------------------

struct GatewayConnector;

#[async_trait]
impl crate::comm::ChannelConnector for GatewayConnector {
    fn name(&self) -> &str { "gateway" }
    fn matches(&self, channel: &str) -> bool { channel.starts_with("gateway:") }
    async fn send(&self, _channel: &str, text: &str) -> anyhow::Result<()> {
        publish_event_json(&serde_json::json!({
            "type": "agent_reply",
            "text": text,
        }));
        Ok(())
    }
    async fn send_rich(&self, _channel: &str, msg: crate::comm::RichMessage) -> anyhow::Result<()> {
        publish_event_json(&serde_json::json!({
            "type": "agent_rich_reply",
            "message": msg,
        }));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gateway handle
// ---------------------------------------------------------------------------

/// Handle returned by [`start_gateway`].  Holds the broadcast sender so
/// other modules can publish events, plus the command receiver.
pub struct Gateway {
    /// Send events that will be forwarded to all WebSocket clients.
    pub events_tx: broadcast::Sender<String>,
    /// Receive commands sent by WebSocket clients.
    pub commands_rx: mpsc::Receiver<String>,
    /// Server task handle.
    pub handle: JoinHandle<()>,
    /// The address the server is actually listening on.
    pub addr: SocketAddr,
}

// ---------------------------------------------------------------------------
// Shared state injected into axum handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) events_tx: broadcast::Sender<String>,
    pub(crate) commands_tx: mpsc::Sender<String>,
    pub(crate) config_path: std::path::PathBuf,
    pub(crate) api_token: Option<String>,
    pub(crate) store: Arc<Store>,
    pub(crate) scheduler: Arc<SchedulerHandle>,
}

// ---------------------------------------------------------------------------
// Server startup
// ---------------------------------------------------------------------------

/// Start the gateway HTTP + WS server on `addr`.
///
/// Returns a [`Gateway`] holding channels and the server task handle.
pub async fn start_gateway(
    addr: SocketAddr,
    config_path: std::path::PathBuf,
    store: Arc<Store>,
    scheduler: Arc<SchedulerHandle>,
) -> std::io::Result<Gateway> {
    let (events_tx, _) = broadcast::channel::<String>(256);
    let (commands_tx, commands_rx) = mpsc::channel::<String>(256);

    let api_token = std::env::var("CONDUCTOR_API_TOKEN").ok().filter(|s| !s.is_empty());

    let state = AppState {
        events_tx: events_tx.clone(),
        commands_tx,
        config_path,
        api_token,
        store,
        scheduler,
    };

    if state.api_token.is_some() {
        info!("API authentication enabled (CONDUCTOR_API_TOKEN set)");
    } else {
        warn!("API authentication disabled (CONDUCTOR_API_TOKEN not set)");
    }

    let _ = handlers::health::STARTUP_TIME.set(std::time::Instant::now());

    let api_router = Router::new()
        .route("/status", get(handlers::health::status_handler))
        .route("/health", get(handlers::health::api_health))
        // Config
        .route("/config", get(handlers::config::api_config_get).put(handlers::config::api_config_put))
        // Cron (C7)
        .route(
            "/cron",
            get(handlers::cron::api_cron_list).post(handlers::cron::api_cron_create),
        )
        .route(
            "/cron/:name",
            get(handlers::cron::api_cron_get)
                .patch(handlers::cron::api_cron_update)
                .delete(handlers::cron::api_cron_delete),
        )
        .route("/cron/:name/history", get(handlers::cron::api_cron_history))
        .route("/trigger/:name", post(handlers::cron::api_cron_trigger))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    let app = Router::new()
        .nest("/api", api_router)
        // WebSocket
        .route("/ws", get(ws::ws_handler))
        .route("/ws/logs", get(ws::ws_logs_handler))
        .with_state(state)
        .fallback_service(ServeDir::new("static"));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {e}");
        }
    });

    info!(%bound_addr, "gateway started");

    Ok(Gateway {
        events_tx,
        commands_rx,
        handle,
        addr: bound_addr,
    })
}

/// Convenience: start the gateway unless `CONDUCTOR_GATEWAY=0`.
///
/// Listens on `CONDUCTOR_GATEWAY_ADDR` (default `127.0.0.1:3000`).
/// Returns `None` if the gateway is explicitly disabled.
pub async fn spawn_gateway_if_enabled(
    config_path: std::path::PathBuf,
    store: Arc<Store>,
    scheduler: Arc<SchedulerHandle>,
) -> Option<Gateway> {
    if std::env::var("CONDUCTOR_GATEWAY").as_deref() == Ok("0") {
        info!("gateway disabled (CONDUCTOR_GATEWAY=0)");
        return None;
    }

    let addr: SocketAddr = match std::env::var("CONDUCTOR_GATEWAY_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
        .parse()
    {
        Ok(a) => a,
        Err(e) => {
            error!("invalid CONDUCTOR_GATEWAY_ADDR: {e}");
            return None;
        }
    };

    // Try up to 10 consecutive ports so a stale process doesn't block startup.
    let max_attempts = 10u16;
    let mut attempt_addr = addr;
    for attempt in 0..max_attempts {
        match start_gateway(attempt_addr, config_path.clone(), store.clone(), scheduler.clone()).await {
            Ok(gw) => {
                set_global_events_tx(gw.events_tx.clone());
                crate::comm::register_connector(Arc::new(GatewayConnector)).await;
                if attempt > 0 {
                    info!(
                        original = %addr,
                        bound = %gw.addr,
                        "port {} in use, auto-bound to {}",
                        addr.port(),
                        gw.addr.port(),
                    );
                }
                info!(addr = %gw.addr, "gateway enabled");
                return Some(gw);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt + 1 < max_attempts => {
                debug!(port = attempt_addr.port(), "port in use, trying next");
                attempt_addr.set_port(attempt_addr.port() + 1);
            }
            Err(e) => {
                error!("failed to start gateway: {e}");
                return None;
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Command forwarding (WS client commands → comm bus)
// ---------------------------------------------------------------------------

/// Spawn a background task that reads commands from `commands_rx` and
/// forwards each one into the [`crate::comm`] message bus as an
/// `IncomingMessage` from the `"gateway"` channel. The gateway WS feed
/// is an observability/control surface, not a chat producer — slash
/// commands and task submission live in [`crate::chat`] (C8).
pub fn spawn_command_forwarder(mut commands_rx: mpsc::Receiver<String>) {
    use crate::comm;

    tokio::spawn(async move {
        debug!("gateway command forwarder started");
        while let Some(text) = commands_rx.recv().await {
            let content = if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                parsed
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or(&text)
                    .to_string()
            } else {
                text.clone()
            };

            let msg = comm::IncomingMessage {
                agent_id: None,
                channel: "gateway:ws-client".to_string(),
                author: "ws-client".to_string(),
                content: content.clone(),
                timestamp: std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64,
                session_id: None,
            };
            if let Err(e) = comm::sender().send(msg) {
                warn!(error = %e, "gateway: failed to forward command to comm bus");
            } else {
                publish_event_json(&serde_json::json!({
                    "type": "gateway_command_forwarded",
                    "content": content,
                }));
            }
        }
        debug!("gateway command forwarder stopped (channel closed)");
    });
}
