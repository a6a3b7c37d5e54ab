use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use pgwarden_core::StopMode;
use pgwarden_dcs::DcsProxy;
use pgwarden_postmaster::Postmaster;

use crate::{ApiError, ApiResult};

/// Shared state of the admin surface.
///
/// The handlers never talk to the daemon directly: a switchover mutates the
/// consensus store and the next reconciliation tick reacts, and shutdown is
/// a single cancellation token the whole supervisor hangs off.
#[derive(Clone)]
pub struct AdminState {
    pub proxy: Arc<DcsProxy>,
    pub postmaster: Arc<Postmaster>,
    pub shutdown: CancellationToken,
}

/// Build the admin router.
pub fn admin_routes(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/switchover/:instance_id", get(switchover))
        .route("/stop", get(stop))
        .route("/shutdown", get(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

/// Hand leadership to the named instance. Only works on the current
/// leader; the demoted node re-bootstraps itself on its next tick.
async fn switchover(
    State(state): State<AdminState>,
    Path(instance_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    tracing::info!(candidate = %instance_id, "switchover requested");
    state
        .proxy
        .promote(&instance_id)
        .await
        .map_err(|e| ApiError::switchover(e.to_string()))?;

    Ok(Json(json!({
        "message": format!("instance {} promoted", instance_id)
    })))
}

/// Smart-stop the local PostgreSQL. The daemon may start it again on a
/// later tick; this is an operator tool for maintenance windows.
async fn stop(State(state): State<AdminState>) -> ApiResult<impl IntoResponse> {
    tracing::info!("manual stop requested");
    state
        .postmaster
        .stop(StopMode::Smart)
        .await
        .map_err(|e| ApiError::stop(e.to_string()))?;

    Ok(Json(json!({
        "message": "postgresql stopped"
    })))
}

/// Begin supervisor shutdown. Responds before the process exits.
async fn shutdown(State(state): State<AdminState>) -> impl IntoResponse {
    tracing::info!("shutdown requested via admin endpoint");
    state.shutdown.cancel();
    Json(json!({
        "message": "shutting down"
    }))
}
