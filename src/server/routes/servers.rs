//! Monitored-channel configuration endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::database::ServerChannel;
use crate::server::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SetChannelRequest {
    pub channel_id: String,
}

/// GET /api/servers/:server_id/channel
pub async fn get_channel(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerChannel>, StatusCode> {
    match state.db.server_channel(&server_id) {
        Ok(Some(channel)) => Ok(Json(channel)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(?e, "Failed to fetch study channel");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /api/servers/:server_id/channel
pub async fn set_channel(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
    Json(request): Json<SetChannelRequest>,
) -> Result<Json<ServerChannel>, StatusCode> {
    let channel_id = request.channel_id.trim();
    if channel_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let saved = state
        .db
        .set_study_channel(&server_id, channel_id)
        .and_then(|()| state.db.server_channel(&server_id));
    match saved {
        Ok(Some(channel)) => Ok(Json(channel)),
        Ok(None) => Err(StatusCode::INTERNAL_SERVER_ERROR),
        Err(e) => {
            tracing::error!(?e, "Failed to set study channel");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/servers/:server_id - Delete a server's channel configuration.
pub async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerChannel>, StatusCode> {
    match state.db.delete_server(&server_id) {
        Ok(Some(deleted)) => Ok(Json(deleted)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(?e, "Failed to delete server");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
