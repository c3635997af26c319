//! Downstream funds and matching calls.
//!
//! [`FundsService`] and [`MatchingService`] make exactly one physical
//! attempt per call and classify the result. [`ActivityGateway`] wraps them
//! with the per-call timeout and retry policy.
//!
//! Both services must deduplicate effects by the idempotency key carried on
//! every request: the saga re-issues a call with the same key after a
//! timeout, a retry or a restart, and relies on the service to apply it at
//! most once.

mod http;
mod memory;
mod policy;

pub use http::{GatewayError, HttpFundsClient, HttpMatchingClient};
pub use memory::{
    BookedOrder, CallLog, CallRecord, HeldFunds, InMemoryFundsService, InMemoryMatchingService,
    ReservationStatus, ScriptedFailure,
};
pub use policy::{CallPolicy, RetryPolicy};

use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use domain::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::idempotency::{IdempotencyKey, Step};

/// The five downstream operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ReserveFunds,
    CommitReservation,
    CancelReservation,
    PlaceOrder,
    CancelOrder,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ReserveFunds => "reserve_funds",
            Operation::CommitReservation => "commit_reservation",
            Operation::CancelReservation => "cancel_reservation",
            Operation::PlaceOrder => "place_order",
            Operation::CancelOrder => "cancel_order",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a downstream call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    /// The call may have taken effect even though no answer arrived.
    pub effect_unknown: bool,
    /// Set when the failure was retryable but every attempt was used up.
    pub retries_exhausted: bool,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            effect_unknown: false,
            retries_exhausted: false,
        }
    }

    /// A failure after which the downstream effect may or may not exist.
    pub fn ambiguous(message: impl Into<String>) -> Self {
        Self {
            effect_unknown: true,
            ..Self::new(message)
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Classified result of a forward or compensating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Success(T),
    /// Transient; safe to retry under the same idempotency key.
    RetryableFailure(StepFailure),
    /// Must not be retried.
    FatalFailure(StepFailure),
}

impl<T> StepOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        match self {
            StepOutcome::Success(value) => StepOutcome::Success(f(value)),
            StepOutcome::RetryableFailure(failure) => StepOutcome::RetryableFailure(failure),
            StepOutcome::FatalFailure(failure) => StepOutcome::FatalFailure(failure),
        }
    }

    /// Splits into the success value or the failure, whichever kind it was.
    pub fn into_result(self) -> Result<T, StepFailure> {
        match self {
            StepOutcome::Success(value) => Ok(value),
            StepOutcome::RetryableFailure(failure) | StepOutcome::FatalFailure(failure) => {
                Err(failure)
            }
        }
    }
}

/// Status reported by the matching service for a placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Matched,
    Pending,
    PartiallyFilled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Matched => "MATCHED",
            OrderStatus::Pending => "PENDING",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hold funds for one saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveFunds {
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub saga_id: SagaId,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub status: String,
}

/// Submit an order backed by an existing reservation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub user_id: String,
    pub event_id: String,
    pub market_id: String,
    pub selection_id: String,
    pub side: Side,
    pub odds: Decimal,
    pub stake: Decimal,
    pub currency: String,
    pub reservation_id: String,
    pub saga_id: SagaId,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub order_id: String,
    #[serde(default)]
    pub match_id: Option<String>,
    pub status: OrderStatus,
}

/// Commit or cancel an existing reservation or order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCall {
    #[serde(skip)]
    pub resource_id: String,
    pub saga_id: SagaId,
    pub idempotency_key: IdempotencyKey,
}

/// Status answer for commit and cancel calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub status: String,
}

/// Funds custody: holds, commits and releases money for a saga.
#[async_trait]
pub trait FundsService: Send + Sync {
    async fn reserve_funds(&self, request: &ReserveFunds) -> StepOutcome<Reservation>;

    async fn commit_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement>;

    async fn cancel_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement>;
}

/// Order book: places and cancels orders.
#[async_trait]
pub trait MatchingService: Send + Sync {
    async fn place_order(&self, request: &PlaceOrder) -> StepOutcome<Placement>;

    async fn cancel_order(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement>;
}

/// The saga's single door to the downstream services.
///
/// Forward calls use the forward policy; cancellations use the deliberately
/// weaker compensation policy so a stuck rollback is reported rather than
/// retried indefinitely.
pub struct ActivityGateway<F, M> {
    funds: F,
    matching: M,
    forward: CallPolicy,
    compensation: CallPolicy,
}

impl<F, M> ActivityGateway<F, M>
where
    F: FundsService,
    M: MatchingService,
{
    pub fn new(funds: F, matching: M, forward: CallPolicy, compensation: CallPolicy) -> Self {
        Self {
            funds,
            matching,
            forward,
            compensation,
        }
    }

    pub fn funds(&self) -> &F {
        &self.funds
    }

    pub fn matching(&self) -> &M {
        &self.matching
    }

    /// How long after a `step` call was logged its caller may still be
    /// working on it. Past this the caller has given up or died.
    pub fn call_lease(&self, step: Step) -> Duration {
        let policy = if step.is_compensating() {
            &self.compensation
        } else {
            &self.forward
        };
        policy.worst_case() + policy.timeout
    }

    #[tracing::instrument(skip_all, fields(saga_id = %request.saga_id, key = %request.idempotency_key))]
    pub async fn reserve_funds(&self, request: &ReserveFunds) -> StepOutcome<Reservation> {
        self.forward
            .run(Operation::ReserveFunds, move || {
                self.funds.reserve_funds(request)
            })
            .await
    }

    #[tracing::instrument(skip_all, fields(saga_id = %request.saga_id, reservation_id = %request.resource_id))]
    pub async fn commit_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        self.forward
            .run(Operation::CommitReservation, move || {
                self.funds.commit_reservation(request)
            })
            .await
    }

    #[tracing::instrument(skip_all, fields(saga_id = %request.saga_id, reservation_id = %request.resource_id))]
    pub async fn cancel_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        self.compensation
            .run(Operation::CancelReservation, move || {
                self.funds.cancel_reservation(request)
            })
            .await
    }

    /// Places an order. An order the book reports as already cancelled is a
    /// fatal failure: retrying under the same key would return the same
    /// answer.
    #[tracing::instrument(skip_all, fields(saga_id = %request.saga_id, key = %request.idempotency_key))]
    pub async fn place_order(&self, request: &PlaceOrder) -> StepOutcome<Placement> {
        let outcome = self
            .forward
            .run(Operation::PlaceOrder, move || {
                self.matching.place_order(request)
            })
            .await;

        match outcome {
            StepOutcome::Success(placement) if placement.status == OrderStatus::Cancelled => {
                StepOutcome::FatalFailure(StepFailure::new(format!(
                    "order {} was cancelled by the matching service",
                    placement.order_id
                )))
            }
            other => other,
        }
    }

    #[tracing::instrument(skip_all, fields(saga_id = %request.saga_id, order_id = %request.resource_id))]
    pub async fn cancel_order(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        self.compensation
            .run(Operation::CancelOrder, move || {
                self.matching.cancel_order(request)
            })
            .await
    }
}
