//! Order placement endpoints backed by the saga runner.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::SagaId;
use domain::OrderRequest;
use event_store::EventStore;
use rust_decimal::Decimal;
use saga::{
    CompensationFailure, CompensationStatus, FailureKind, FundsService, MatchingService,
    OrderStatus, SagaRecord, SagaState, Step,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

/// Body of `POST /orders`: the order fields plus an optional saga ID
/// chosen by the caller.
#[derive(Deserialize)]
pub struct PlaceOrderBody {
    #[serde(default)]
    pub saga_id: Option<SagaId>,
    #[serde(flatten)]
    pub order: OrderRequest,
}

// -- Response types --

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub saga_id: SagaId,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub user_id: Option<String>,
    pub side: Option<String>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub odds: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub stake: Option<Decimal>,
    /// Profit if the order wins, excluding the returned stake.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub potential_winnings: Option<Decimal>,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub reserved_amount: Option<Decimal>,
    pub reservation_id: Option<String>,
    pub order_id: Option<String>,
    pub match_id: Option<String>,
    pub order_status: Option<OrderStatus>,
    pub failed_step: Option<Step>,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub compensation_status: CompensationStatus,
    pub compensated_steps: Vec<Step>,
    pub compensation_failures: Vec<CompensationFailure>,
    pub requires_attention: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl SagaStatusResponse {
    fn from_record(saga_id: SagaId, record: &SagaRecord) -> Self {
        let request = record.request();
        Self {
            saga_id,
            state: record.state(),
            user_id: request.map(|r| r.user_id.clone()),
            side: request.map(|r| r.side.clone()),
            odds: request.map(|r| r.odds),
            stake: request.map(|r| r.stake),
            potential_winnings: request.and_then(|r| r.potential_winnings().ok()),
            reserved_amount: record.reserved_amount(),
            reservation_id: record.reservation_id().map(String::from),
            order_id: record.order_id().map(String::from),
            match_id: record.match_id().map(String::from),
            order_status: record.order_status(),
            failed_step: record.failed_step(),
            failure_reason: record.failure_reason().map(String::from),
            failure_kind: record.failure_kind(),
            compensation_status: record.compensation(),
            compensated_steps: record.compensated_steps().to_vec(),
            compensation_failures: record.compensation_failures().to_vec(),
            requires_attention: record.requires_attention(),
            created_at: record.created_at(),
            updated_at: record.updated_at(),
            settled_at: record.settled_at(),
        }
    }
}

/// Response type for one entry of the saga log.
#[derive(Serialize)]
pub struct EventEnvelopeResponse {
    pub event_id: String,
    pub event_type: String,
    pub saga_id: String,
    pub version: i64,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

// -- Handlers --

/// POST /orders: log a new saga and queue it. Validation happens inside
/// the saga; a rejected order shows up as `FAILED` on the status endpoint.
#[tracing::instrument(skip_all)]
pub async fn place<S, F, M>(
    State(state): State<Arc<AppState<S, F, M>>>,
    body: Result<Json<PlaceOrderBody>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError>
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    let Json(body) = body?;
    let saga_id = state.runner.submit(body.order, body.saga_id).await?;
    tracing::info!(%saga_id, "order accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            saga_id,
            status: "PROCESSING",
        }),
    ))
}

/// GET /orders/{id}: current state of a saga.
#[tracing::instrument(skip(state))]
pub async fn status<S, F, M>(
    State(state): State<Arc<AppState<S, F, M>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError>
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let record = state
        .runner
        .coordinator()
        .get_saga(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    Ok(Json(SagaStatusResponse::from_record(saga_id, &record)))
}

/// GET /orders/{id}/events: the saga's log, oldest first.
#[tracing::instrument(skip(state))]
pub async fn events<S, F, M>(
    State(state): State<Arc<AppState<S, F, M>>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<EventEnvelopeResponse>>, ApiError>
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let envelopes = state.runner.coordinator().saga_events(saga_id).await?;
    if envelopes.is_empty() {
        return Err(ApiError::NotFound(format!("Saga {id} not found")));
    }

    let responses: Vec<EventEnvelopeResponse> = envelopes
        .into_iter()
        .map(|e| EventEnvelopeResponse {
            event_id: e.event_id.to_string(),
            event_type: e.event_type,
            saga_id: e.stream_id.to_string(),
            version: e.version.as_i64(),
            timestamp: e.timestamp.to_rfc3339(),
            payload: e.payload,
        })
        .collect();

    Ok(Json(responses))
}

/// POST /orders/{id}/cancel: ask a running saga to stop at its next step.
#[tracing::instrument(skip(state))]
pub async fn cancel<S, F, M>(
    State(state): State<Arc<AppState<S, F, M>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError>
where
    S: EventStore + 'static,
    F: FundsService + 'static,
    M: MatchingService + 'static,
{
    let saga_id = parse_saga_id(&id)?;
    let record = state
        .runner
        .coordinator()
        .get_saga(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    if record.state().is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Saga {id} already finished as {}",
            record.state()
        )));
    }
    if !state.runner.cancel(saga_id).await {
        return Err(ApiError::Conflict(format!(
            "Saga {id} is not running on this node"
        )));
    }
    tracing::info!(%saga_id, "cancellation requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            saga_id,
            status: "CANCELLING",
        }),
    ))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga ID: {e}")))
}
