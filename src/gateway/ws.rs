use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tracing::warn;

use super::AppState;

/// `GET /ws` — upgrade to WebSocket.
pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// `GET /ws/logs` — upgrade to WebSocket for live log streaming.
pub(crate) async fn ws_logs_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_ws_logs)
}

/// Per-connection WebSocket logic for log streaming.
async fn handle_ws_logs(mut socket: WebSocket) {
    let mut rx = match crate::logs::subscribe() {
        Some(rx) => rx,
        None => {
            let _ = socket
                .send(Message::Text(
                    r#"{"type":"error","message":"log broadcast not initialised"}"#.into(),
                ))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            Ok(line) = rx.recv() => {
                if socket.send(Message::Text(line)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {} // ignore client messages
                }
            }
        }
    }
}

/// Per-connection WebSocket logic. Replays currently-registered cron
/// job names on connect, then relays the live broadcast feed.
async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let mut events_rx = state.events_tx.subscribe();

    let jobs = state.scheduler.status().await;
    let list_event = serde_json::json!({
        "type": "cron_job_list",
        "jobs": jobs,
    });
    if let Ok(json) = serde_json::to_string(&list_event) {
        let _ = socket.send(Message::Text(json)).await;
    }

    loop {
        tokio::select! {
            // Broadcast event → send to client
            Ok(event) = events_rx.recv() => {
                if socket.send(Message::Text(event)).await.is_err() {
                    break; // client disconnected
                }
            }
            // Client message → forward to commands channel
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if state.commands_tx.send(text).await.is_err() {
                            warn!("commands channel closed");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("ws recv error: {e}");
                        break;
                    }
                    _ => {} // ping/pong/binary — ignore
                }
            }
        }
    }
}
