//! Broadcast feeds carried over WebSocket.
//!
//! Two feeds exist: dashboard events (`/ws`) and outbound platform
//! commands consumed by the chat bridge (`/ws/bridge`).

use tokio::sync::broadcast;

/// Sender side of a JSON broadcast feed.
pub type EventFeed = broadcast::Sender<String>;

/// Creates a feed with room for `capacity` unread messages per subscriber.
pub fn channel(capacity: usize) -> EventFeed {
    let (tx, _) = broadcast::channel(capacity);
    tx
}

/// Publishes a typed message. Returns `true` if at least one subscriber
/// received it.
pub fn publish(feed: &EventFeed, update_type: &str, data: &impl serde::Serialize) -> bool {
    let message = serde_json::json!({
        "type": update_type,
        "data": data,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    match serde_json::to_string(&message) {
        Ok(json) => feed.send(json).is_ok(),
        Err(e) => {
            tracing::warn!(?e, update_type, "Failed to serialize feed message");
            false
        }
    }
}
