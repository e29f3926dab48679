pub mod health;
pub mod response;
pub mod status;

use axum::routing::get;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status::get_status))
        .route("/api/v1/alerts", get(status::get_alerts))
        .route("/api/v1/alerts/deck", get(status::get_deck))
        .route("/api/v1/alerts/latest", get(status::get_latest_event))
        .route("/health", get(health::health_check))
        .route("/health/live", get(health::liveness_check))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
