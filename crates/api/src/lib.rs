//! HTTP surface for the order placement saga.
//!
//! Accepts orders, reports saga state and exposes cancellation, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use event_store::EventStore;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{FundsService, MatchingService, SagaRunner};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<S, F, M> {
    pub runner: Arc<SagaRunner<S, F, M>>,
}

impl<S, F, M> AppState<S, F, M> {
    pub fn new(runner: Arc<SagaRunner<S, F, M>>) -> Arc<Self> {
        Arc::new(Self { runner })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, F, M>(state: Arc<AppState<S, F, M>>, metrics_handle: PrometheusHandle) -> Router
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S, F, M>))
        .route("/orders", post(routes::orders::place::<S, F, M>))
        .route("/orders/{id}", get(routes::orders::status::<S, F, M>))
        .route("/orders/{id}/events", get(routes::orders::events::<S, F, M>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S, F, M>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
