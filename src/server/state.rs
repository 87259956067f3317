//! Shared application state for the HTTP server.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::crypto::KeyManager;
use crate::database::Database;
use crate::feed::EventFeed;
use crate::monitor::StudyMonitor;
use crate::verify::VerdictWaiters;

/// Application state shared across all handlers.
#[derive(Debug)]
pub struct AppState {
    pub monitor: StudyMonitor,
    pub db: Arc<Database>,
    pub waiters: Arc<VerdictWaiters>,
    pub keys: Arc<KeyManager>,
    /// Dashboard events.
    pub events: EventFeed,
    /// Outbound commands for the platform bridge.
    pub bridge: EventFeed,
    /// Base URL of verification links.
    pub public_url: String,
}

impl AppState {
    /// Subscribe to dashboard events.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    /// Subscribe to outbound bridge commands.
    pub fn subscribe_bridge(&self) -> broadcast::Receiver<String> {
        self.bridge.subscribe()
    }
}
