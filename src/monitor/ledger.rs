//! Session ledger: open study sessions and their closing arithmetic.
//!
//! A session starts when a user enters the study channel (or when
//! accounting restarts after they turn their camera off) and ends when
//! they leave. Ended sessions produce a [`ClosedSession`] that is handed
//! to the store for durable accumulation; cancelled sessions are dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::error::MonitorError;

/// An open study session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenSession {
    pub user_id: String,
    pub server_id: String,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
}

/// A session that was ended and must be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedSession {
    /// Stable key for idempotent persistence.
    pub session_key: String,
    pub user_id: String,
    pub server_id: String,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_secs: u64,
}

/// Computes the persistence key of a session.
pub fn session_key(user_id: &str, server_id: &str, started_at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(server_id.as_bytes());
    hasher.update(b"|");
    hasher.update(
        started_at
            .to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Per-user open sessions, shared by every user's processing scope.
#[derive(Debug, Default)]
pub struct SessionLedger {
    open: RwLock<HashMap<String, OpenSession>>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a session at `now`. Any session already open for the user is
    /// discarded and returned.
    pub fn start(
        &self,
        user_id: &str,
        server_id: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Option<OpenSession> {
        let session = OpenSession {
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            display_name: display_name.to_string(),
            started_at: now,
        };
        let replaced = self
            .open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), session);

        if let Some(prev) = &replaced {
            tracing::debug!(
                user_id = %user_id,
                discarded_secs = (now - prev.started_at).num_seconds().max(0),
                "Restarted session accounting"
            );
        } else {
            tracing::debug!(user_id = %user_id, "Session started");
        }
        replaced
    }

    /// Closes the user's session and returns it with its elapsed time.
    ///
    /// A missing session is reported and yields `None`. An end time before
    /// the start time clamps elapsed to zero.
    pub fn end(
        &self,
        user_id: &str,
        server_id: &str,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Option<ClosedSession> {
        let Some(open) = self
            .open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id)
        else {
            tracing::warn!(user_id = %user_id, "No open session to end");
            return None;
        };

        let delta = now - open.started_at;
        let elapsed_secs = if delta < chrono::Duration::zero() {
            let anomaly = MonitorError::ClockAnomaly {
                user_id: user_id.to_string(),
                skew_ms: -delta.num_milliseconds(),
            };
            tracing::warn!(error = %anomaly, "Recording zero elapsed time");
            0
        } else {
            delta.num_seconds() as u64
        };

        let display_name = if display_name.is_empty() {
            open.display_name
        } else {
            display_name.to_string()
        };

        Some(ClosedSession {
            session_key: session_key(user_id, server_id, open.started_at),
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            display_name,
            started_at: open.started_at,
            ended_at: now,
            elapsed_secs,
        })
    }

    /// Closes the user's session without accounting for it.
    pub fn cancel(&self, user_id: &str) -> Option<OpenSession> {
        let removed = self
            .open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
        if removed.is_some() {
            tracing::debug!(user_id = %user_id, "Session cancelled");
        }
        removed
    }

    pub fn get(&self, user_id: &str) -> Option<OpenSession> {
        self.open
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}
