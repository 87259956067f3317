//! Verdict submission from the verification page.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::crypto::{self, TokenError};
use crate::server::state::AppState;
use crate::verify::NetworkVerdict;

#[derive(Debug, Serialize)]
pub struct VerdictAccepted {
    pub user_id: String,
    pub good_connection: bool,
}

/// POST /api/verify/:token - Deliver measured speeds for a pending request.
pub async fn submit_verdict(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    Json(verdict): Json<NetworkVerdict>,
) -> Result<Json<VerdictAccepted>, StatusCode> {
    let claims = crypto::verify(state.keys.verifying_key(), &token, Utc::now()).map_err(|e| {
        tracing::warn!(error = %e, "Rejected verification token");
        match e {
            TokenError::Malformed => StatusCode::BAD_REQUEST,
            TokenError::BadSignature => StatusCode::UNAUTHORIZED,
            TokenError::Expired => StatusCode::GONE,
        }
    })?;

    let values = [verdict.download_mbps, verdict.upload_mbps, verdict.ping_ms];
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(StatusCode::BAD_REQUEST);
    }

    if !state.waiters.submit(&claims.sub, &claims.nonce, verdict) {
        return Err(StatusCode::CONFLICT);
    }

    Ok(Json(VerdictAccepted {
        good_connection: state.monitor.config().thresholds.is_good(&verdict),
        user_id: claims.sub,
    }))
}
