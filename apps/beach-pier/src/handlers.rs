use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use tracing::error;

use crate::{session::SessionState, AppState};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub live_sessions: usize,
    pub established_sessions: usize,
    pub idempotency_keys: usize,
}

/// GET /health - Health check endpoint
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// GET /debug/stats - Session and idempotency counters
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, StatusCode> {
    let sessions = state.registry.snapshot();
    let established_sessions = sessions
        .iter()
        .filter(|session| session.state == SessionState::Established)
        .count();

    let idempotency_keys = state.coordinator.len().await.map_err(|err| {
        error!("Failed to count idempotency keys: {}", err);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(StatsResponse {
        live_sessions: sessions.len(),
        established_sessions,
        idempotency_keys,
    }))
}

/// GET /metrics - Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
