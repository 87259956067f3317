//! Error types shared across the monitor, persistence and platform layers.
//!
//! None of these are fatal: the monitor logs them and keeps advancing
//! its local state machine.

use thiserror::Error;

/// Errors raised by the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database connection lock poisoned")]
    Poisoned,
}

/// Errors returned by the chat platform bridge for outbound actions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("no platform bridge connected")]
    NoBridge,

    #[error("missing permission for {0}")]
    Forbidden(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// A notify/move/persist call failed. Local state already advanced.
    #[error("external action `{action}` failed: {reason}")]
    ExternalAction { action: &'static str, reason: String },

    /// A session closed with an end time before its start time.
    #[error("clock went backwards by {skew_ms}ms for user {user_id}")]
    ClockAnomaly { user_id: String, skew_ms: i64 },

    /// No monitored channel is configured for the server.
    #[error("no study channel configured for server {server_id}")]
    ConfigMissing { server_id: String },

    /// The network-quality verdict did not arrive in time.
    #[error("no network verdict for user {user_id} within the wait window")]
    TimeoutNoVerdict { user_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MonitorError {
    pub fn external(action: &'static str, reason: impl ToString) -> Self {
        Self::ExternalAction {
            action,
            reason: reason.to_string(),
        }
    }
}
