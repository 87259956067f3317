//! Health check endpoint.

use axum::{extract::State, Json};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::server::state::AppState;

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub tracked_users: usize,
    pub bridge_connected: bool,
}

/// Marks the process start for uptime reporting.
pub fn mark_started() {
    Lazy::force(&STARTED);
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: STARTED.elapsed().as_secs(),
        tracked_users: state.monitor.tracked_count(),
        bridge_connected: state.bridge.receiver_count() > 0,
    })
}
