//! Learner data export and deletion.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::database::LearnerRecord;
use crate::server::state::AppState;

/// GET /api/learners/:user_id - Everything stored about a learner.
pub async fn get_learner(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<LearnerRecord>, StatusCode> {
    match state.db.learner(&user_id) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(?e, "Failed to fetch learner");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/learners/:user_id - Delete a learner and return the deleted data.
pub async fn delete_learner(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<LearnerRecord>, StatusCode> {
    match state.db.delete_learner(&user_id) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(?e, "Failed to delete learner");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
