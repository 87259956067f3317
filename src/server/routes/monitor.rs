//! Live monitor snapshot.

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::monitor::TrackedUserView;
use crate::server::state::AppState;

#[derive(Debug, Serialize)]
pub struct MonitorResponse {
    pub tracked: Vec<TrackedUserView>,
    pub open_sessions: usize,
    pub active_exemptions: usize,
}

/// GET /api/monitor - Every tracked user with state, session start and timer.
pub async fn get_monitor(State(state): State<Arc<AppState>>) -> Json<MonitorResponse> {
    Json(MonitorResponse {
        tracked: state.monitor.snapshot().await,
        open_sessions: state.monitor.ledger().open_count(),
        active_exemptions: state.monitor.exemptions().len(),
    })
}
