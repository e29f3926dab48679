use axum::extract::{Query, State};
use serde::Deserialize;

use crate::alerts::{AlertsView, CollapsedEvent, DeckEntry};
use crate::api::response::ApiResponse;
use crate::app::AppState;
use crate::status::StatusReport;

/// GET /api/v1/status - current controller status
///
/// One flat record with decoded meter and output electrics, data ages,
/// the compensation set-point and the last cloud fields.
pub async fn get_status(State(state): State<AppState>) -> ApiResponse<StatusReport> {
    ApiResponse::success(state.status_report())
}

/// GET /api/v1/alerts - active alerts plus recent raise/resolve events
pub async fn get_alerts(State(state): State<AppState>) -> ApiResponse<AlertsView> {
    ApiResponse::success(state.alerts.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct DeckParams {
    #[serde(default = "default_deck_limit")]
    pub limit: usize,
}

fn default_deck_limit() -> usize {
    20
}

/// GET /api/v1/alerts/deck?limit=N - active and recently resolved episodes
pub async fn get_deck(
    State(state): State<AppState>,
    Query(params): Query<DeckParams>,
) -> ApiResponse<Vec<DeckEntry>> {
    ApiResponse::success(state.alerts.deck(params.limit))
}

#[derive(Debug, Deserialize)]
pub struct CollapsedParams {
    #[serde(default = "default_gap_ms")]
    pub gap_ms: i64,
}

fn default_gap_ms() -> i64 {
    60_000
}

/// GET /api/v1/alerts/latest?gap_ms=N - newest event with identical
/// repeats within the gap folded into one item
pub async fn get_latest_event(
    State(state): State<AppState>,
    Query(params): Query<CollapsedParams>,
) -> ApiResponse<Option<CollapsedEvent>> {
    ApiResponse::success(state.alerts.latest_collapsed(params.gap_ms))
}
