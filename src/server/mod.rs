//! HTTP server for presence ingest, the platform bridge and the REST API.

pub mod bridge;
pub mod routes;
pub mod state;
pub mod ws;

use crate::server::routes::{
    config, exemptions, health, leaderboard, learners, monitor, presence, servers, verification,
};
use crate::server::state::AppState;
use crate::server::ws::{bridge_handler, ws_handler};

use axum::{
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub use bridge::BridgePlatform;

/// Builds the application router.
pub fn router(state: Arc<AppState>) -> Router {
    // CORS layer for the verification page and dashboards
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Engine
        .route("/api/presence", post(presence::ingest))
        .route("/api/monitor", get(monitor::get_monitor))
        // Servers
        .route(
            "/api/servers/:server_id/channel",
            get(servers::get_channel).put(servers::set_channel),
        )
        .route(
            "/api/servers/:server_id",
            axum::routing::delete(servers::delete_server),
        )
        // Learners
        .route("/api/leaderboard", get(leaderboard::get_leaderboard))
        .route(
            "/api/learners/:user_id",
            get(learners::get_learner).delete(learners::delete_learner),
        )
        // Exemptions
        .route(
            "/api/exemptions/:user_id",
            get(exemptions::get_exemption).post(exemptions::request_exemption),
        )
        .route("/api/verify/:token", post(verification::submit_verdict))
        // Config API
        .route("/api/config", get(config::get_config))
        .route("/api/config/:key", put(config::set_config))
        // WebSockets
        .route("/ws", get(ws_handler))
        .route("/ws/bridge", get(bridge_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the API on `addr` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    health::mark_started();

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
