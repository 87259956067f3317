//! Configuration endpoints.
//!
//! Values are read when the monitor starts; changes apply on restart.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub settings: Vec<ConfigSetting>,
}

#[derive(Debug, Serialize)]
pub struct ConfigSetting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub value: String,
}

/// GET /api/config - Get all configuration settings
pub async fn get_config(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConfigResponse>, StatusCode> {
    match state.db.get_all_config() {
        Ok(config) => {
            let settings = config
                .into_iter()
                .map(|(key, value, description)| ConfigSetting {
                    key,
                    value,
                    description,
                })
                .collect();

            Ok(Json(ConfigResponse { settings }))
        }
        Err(e) => {
            tracing::error!(?e, "Failed to fetch config");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// PUT /api/config/:key - Update one known setting.
pub async fn set_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(request): Json<SetConfigRequest>,
) -> StatusCode {
    match state.db.set_config(&key, request.value.trim()) {
        Ok(true) => {
            tracing::info!(key = %key, value = %request.value, "Config updated, applies on restart");
            StatusCode::NO_CONTENT
        }
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!(?e, "Failed to update config");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
