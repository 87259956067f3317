//! Exemption requests.
//!
//! A request issues a signed verification link and starts a bounded wait
//! for the verdict posted by the verification page.

use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::crypto::{self, VerificationClaims, DEFAULT_TOKEN_TTL};
use crate::feed;
use crate::server::state::AppState;
use crate::verify::{self, VerificationOutcome};

#[derive(Debug, Serialize)]
pub struct ExemptionRequestResponse {
    pub user_id: String,
    pub token: String,
    pub link: String,
    pub link_expires_at: DateTime<Utc>,
    pub verdict_timeout_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ExemptionStatus {
    pub user_id: String,
    pub exempt: bool,
    pub remaining_secs: Option<u64>,
    pub verification_pending: bool,
}

/// POST /api/exemptions/:user_id - Start a network verification.
pub async fn request_exemption(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<ExemptionRequestResponse> {
    let now = Utc::now();
    let claims = VerificationClaims::new(&user_id, DEFAULT_TOKEN_TTL, now);
    let token = crypto::issue(state.keys.signing_key(), &claims);
    let link = format!("{}/api/verify/{}", state.public_url, token);

    let pending = state.waiters.register(&user_id, &claims.nonce);
    let monitor = state.monitor.clone();
    let events = state.events.clone();
    tokio::spawn(async move {
        let user_id = pending.user_id().to_string();
        let outcome = verify::run_verification(monitor, pending).await;
        if outcome == VerificationOutcome::ExemptionGranted {
            feed::publish(
                &events,
                "exemption_granted",
                &serde_json::json!({ "user_id": user_id }),
            );
        }
    });

    tracing::info!(user_id = %user_id, "Exemption verification requested");
    Json(ExemptionRequestResponse {
        user_id,
        token,
        link,
        link_expires_at: now + chrono::Duration::seconds(DEFAULT_TOKEN_TTL.as_secs() as i64),
        verdict_timeout_secs: state.monitor.config().verdict_timeout.as_secs(),
    })
}

/// GET /api/exemptions/:user_id - Current exemption status.
pub async fn get_exemption(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<ExemptionStatus> {
    let exemptions = state.monitor.exemptions();
    Json(ExemptionStatus {
        exempt: exemptions.is_exempt(&user_id),
        remaining_secs: exemptions.remaining(&user_id).map(|d| d.as_secs()),
        verification_pending: state.waiters.is_pending(&user_id),
        user_id,
    })
}
