//! WebSocket handlers.
//!
//! `/ws` streams dashboard events after an initial snapshot. `/ws/bridge`
//! is the chat bridge: it receives outbound commands and sends presence
//! changes back as text frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::monitor::{PresenceChange, StudyMonitor};
use crate::server::state::AppState;

/// Dashboard WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_dashboard(socket, state))
}

/// Bridge WebSocket upgrade handler.
pub async fn bridge_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_bridge(socket, state))
}

async fn handle_dashboard(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(initial_state) = current_state(&state).await {
        let _ = sender.send(Message::Text(initial_state)).await;
    }

    let rx = state.subscribe();
    let send_task = tokio::spawn(forward(rx, sender));

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    tracing::debug!("Dashboard WebSocket closed");
}

async fn handle_bridge(socket: WebSocket, state: Arc<AppState>) {
    let (sender, mut receiver) = socket.split();
    tracing::info!("Platform bridge connected");

    let rx = state.subscribe_bridge();
    let send_task = tokio::spawn(forward(rx, sender));

    let monitor = state.monitor.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => ingest_frame(&monitor, &text).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    tracing::info!("Platform bridge disconnected");
}

/// Copies feed messages to the socket until either side goes away.
async fn forward(
    mut rx: broadcast::Receiver<String>,
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
) {
    loop {
        match rx.recv().await {
            Ok(msg) => {
                if sender.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "WebSocket subscriber lagged, messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Feeds one bridge frame to the monitor.
async fn ingest_frame(monitor: &StudyMonitor, text: &str) {
    let change: PresenceChange = match serde_json::from_str(text) {
        Ok(change) => change,
        Err(e) => {
            tracing::warn!(error = %e, "Unparsable bridge frame");
            return;
        }
    };
    match monitor.handle(&change).await {
        Ok(outcome) => tracing::debug!(user_id = %change.user_id, ?outcome, "Bridge presence change"),
        Err(e) => tracing::warn!(user_id = %change.user_id, error = %e, "Bridge presence change failed"),
    }
}

/// Initial dashboard message: every tracked user and exemption counts.
async fn current_state(state: &AppState) -> Option<String> {
    let tracked = state.monitor.snapshot().await;
    let message = serde_json::json!({
        "type": "initial_state",
        "data": {
            "tracked": tracked,
            "open_sessions": state.monitor.ledger().open_count(),
            "active_exemptions": state.monitor.exemptions().len(),
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    serde_json::to_string(&message).ok()
}
