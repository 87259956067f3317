//! Presence ingest endpoint.

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::monitor::{Outcome, PresenceChange};
use crate::server::state::AppState;

/// POST /api/presence - Feed one presence change to the monitor.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(change): Json<PresenceChange>,
) -> Result<Json<Outcome>, StatusCode> {
    match state.monitor.handle(&change).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            tracing::error!(user_id = %change.user_id, error = %e, "Failed to handle presence change");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
