use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::app::AppState;
use crate::status::Health;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: Health,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// GET /health - controller health
///
/// UP only while the cloud link is online and the meter is fresh;
/// DEGRADED otherwise, with a 503 so probes can act on it.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health();
    let status_code = match health {
        Health::Up => StatusCode::OK,
        Health::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status_code,
        Json(HealthResponse {
            status: health,
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /health/live - process liveness
pub async fn liveness_check() -> impl IntoResponse {
    StatusCode::OK
}
