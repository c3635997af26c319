//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use event_store::EventStore;
use saga::{FundsService, MatchingService};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub in_flight: usize,
}

/// GET /health: reports 503 once the runner has started shutting down.
pub async fn check<S, F, M>(
    State(state): State<Arc<AppState<S, F, M>>>,
) -> (StatusCode, Json<HealthResponse>)
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    let in_flight = state.runner.in_flight();
    if state.runner.is_shutting_down() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "shutting_down",
                in_flight,
            }),
        );
    }
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            in_flight,
        }),
    )
}
