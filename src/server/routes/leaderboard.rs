//! Leaderboard endpoint.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::database::LeaderboardEntry;
use crate::server::state::AppState;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    /// Local leaderboard of this server; global if absent.
    pub server_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub server_id: Option<String>,
    pub entries: Vec<LeaderboardEntry>,
}

/// GET /api/leaderboard - Top learners by accumulated time.
///
/// Query params:
/// - `server_id`: Restrict to one server
/// - `limit`: Max entries (default 10, max 100)
pub async fn get_leaderboard(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, StatusCode> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match state.db.leaderboard(query.server_id.as_deref(), limit) {
        Ok(entries) => Ok(Json(LeaderboardResponse {
            server_id: query.server_id,
            entries,
        })),
        Err(e) => {
            tracing::error!(?e, "Failed to fetch leaderboard");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
