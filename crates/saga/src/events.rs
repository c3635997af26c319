//! Saga log events.
//!
//! Every transition and every downstream call intent is logged before it
//! happens; results are logged after. Folding a saga's stream with
//! [`SagaRecord::apply`](crate::SagaRecord) rebuilds its record.

use chrono::{DateTime, Utc};
use common::SagaId;
use domain::{DomainEvent, OrderRequest};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::compensation::{CompensationFailure, CompensationTargets};
use crate::gateway::OrderStatus;
use crate::idempotency::{IdempotencyKey, Step};
use crate::state::{FailureKind, SagaState};

/// Events recorded in a saga's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// Request accepted; the saga exists from here on.
    SagaStarted(SagaStartedData),

    /// Validation began.
    ValidationStarted(ValidationStartedData),

    /// Request passed validation.
    ValidationPassed(ValidationPassedData),

    /// Request failed validation. Nothing was reserved.
    ValidationRejected(ValidationRejectedData),

    /// About to call reserve-funds.
    ReservationRequested(ReservationRequestedData),

    /// Funds are held.
    FundsReserved(FundsReservedData),

    /// About to call place-order.
    PlacementRequested(PlacementRequestedData),

    /// The matching service accepted the order.
    OrderPlaced(OrderPlacedData),

    /// About to call commit-reservation.
    CommitRequested(CommitRequestedData),

    /// Funds committed; the saga is settled.
    ReservationCommitted(ReservationCommittedData),

    /// A logged call whose answer never arrived is being made again.
    CallReissued(CallReissuedData),

    /// A forward step failed for good.
    StepFailed(StepFailedData),

    /// Stopped on request between steps.
    SagaCancelled(SagaCancelledData),

    /// Rollback began for the listed resources.
    CompensationStarted(CompensationStartedData),

    /// About to call one cancellation.
    CompensationStepRequested(CompensationStepRequestedData),

    /// One cancellation succeeded.
    CompensationStepCompleted(CompensationStepData),

    /// One cancellation could not be done.
    CompensationStepFailed(CompensationFailure),

    /// Every cancellation was attempted.
    CompensationFinished(CompensationFinishedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::ValidationStarted(_) => "ValidationStarted",
            SagaEvent::ValidationPassed(_) => "ValidationPassed",
            SagaEvent::ValidationRejected(_) => "ValidationRejected",
            SagaEvent::ReservationRequested(_) => "ReservationRequested",
            SagaEvent::FundsReserved(_) => "FundsReserved",
            SagaEvent::PlacementRequested(_) => "PlacementRequested",
            SagaEvent::OrderPlaced(_) => "OrderPlaced",
            SagaEvent::CommitRequested(_) => "CommitRequested",
            SagaEvent::ReservationCommitted(_) => "ReservationCommitted",
            SagaEvent::CallReissued(_) => "CallReissued",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::SagaCancelled(_) => "SagaCancelled",
            SagaEvent::CompensationStarted(_) => "CompensationStarted",
            SagaEvent::CompensationStepRequested(_) => "CompensationStepRequested",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::CompensationStepFailed(_) => "CompensationStepFailed",
            SagaEvent::CompensationFinished(_) => "CompensationFinished",
        }
    }
}

impl SagaEvent {
    /// State the saga moves to when this event is applied, if it moves.
    pub fn target_state(&self) -> Option<SagaState> {
        match self {
            SagaEvent::ValidationStarted(_) => Some(SagaState::Validating),
            SagaEvent::ValidationPassed(_) => Some(SagaState::Reserving),
            SagaEvent::PlacementRequested(_) => Some(SagaState::Matching),
            SagaEvent::ReservationCommitted(_) => Some(SagaState::Settled),
            SagaEvent::ValidationRejected(_) | SagaEvent::StepFailed(_) => Some(SagaState::Failed),
            SagaEvent::SagaCancelled(_) => Some(SagaState::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    pub request: OrderRequest,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStartedData {
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPassedData {
    /// Liability to reserve.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRejectedData {
    /// Validator's reason, shown to the caller as is.
    pub reason: String,
    /// Metric label for the reason.
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationRequestedData {
    pub idempotency_key: IdempotencyKey,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundsReservedData {
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRequestedData {
    pub idempotency_key: IdempotencyKey,
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlacedData {
    pub order_id: String,
    pub match_id: Option<String>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequestedData {
    pub idempotency_key: IdempotencyKey,
    pub reservation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationCommittedData {
    pub status: String,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReissuedData {
    pub step: Step,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step: Step,
    pub reason: String,
    pub kind: FailureKind,
    /// The step may have taken effect downstream despite failing.
    pub effect_unknown: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCancelledData {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationStartedData {
    pub targets: CompensationTargets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationStepRequestedData {
    pub step: Step,
    pub resource_id: String,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationStepData {
    pub step: Step,
    pub resource_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationFinishedData {
    pub failures: usize,
    pub finished_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(saga_id: SagaId, request: OrderRequest) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            request,
            started_at: Utc::now(),
        })
    }

    pub fn validation_started() -> Self {
        SagaEvent::ValidationStarted(ValidationStartedData {
            started_at: Utc::now(),
        })
    }

    pub fn validation_passed(amount: Decimal) -> Self {
        SagaEvent::ValidationPassed(ValidationPassedData { amount })
    }

    pub fn validation_rejected(reason: impl Into<String>, code: impl Into<String>) -> Self {
        SagaEvent::ValidationRejected(ValidationRejectedData {
            reason: reason.into(),
            code: code.into(),
        })
    }

    pub fn reservation_requested(
        idempotency_key: IdempotencyKey,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        SagaEvent::ReservationRequested(ReservationRequestedData {
            idempotency_key,
            amount,
            currency: currency.into(),
        })
    }

    pub fn funds_reserved(reservation_id: impl Into<String>) -> Self {
        SagaEvent::FundsReserved(FundsReservedData {
            reservation_id: reservation_id.into(),
        })
    }

    pub fn placement_requested(
        idempotency_key: IdempotencyKey,
        reservation_id: impl Into<String>,
    ) -> Self {
        SagaEvent::PlacementRequested(PlacementRequestedData {
            idempotency_key,
            reservation_id: reservation_id.into(),
        })
    }

    pub fn order_placed(
        order_id: impl Into<String>,
        match_id: Option<String>,
        status: OrderStatus,
    ) -> Self {
        SagaEvent::OrderPlaced(OrderPlacedData {
            order_id: order_id.into(),
            match_id,
            status,
        })
    }

    pub fn commit_requested(
        idempotency_key: IdempotencyKey,
        reservation_id: impl Into<String>,
    ) -> Self {
        SagaEvent::CommitRequested(CommitRequestedData {
            idempotency_key,
            reservation_id: reservation_id.into(),
        })
    }

    pub fn reservation_committed(status: impl Into<String>) -> Self {
        SagaEvent::ReservationCommitted(ReservationCommittedData {
            status: status.into(),
            settled_at: Utc::now(),
        })
    }

    pub fn call_reissued(step: Step, idempotency_key: IdempotencyKey) -> Self {
        SagaEvent::CallReissued(CallReissuedData {
            step,
            idempotency_key,
        })
    }

    /// Creates a StepFailed event, prefixing the reason with the step's
    /// context.
    pub fn step_failed(
        step: Step,
        message: &str,
        kind: FailureKind,
        effect_unknown: bool,
    ) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step,
            reason: format!("{}: {message}", step.failure_context()),
            kind,
            effect_unknown,
        })
    }

    pub fn saga_cancelled(reason: impl Into<String>) -> Self {
        SagaEvent::SagaCancelled(SagaCancelledData {
            reason: reason.into(),
        })
    }

    pub fn compensation_started(targets: CompensationTargets) -> Self {
        SagaEvent::CompensationStarted(CompensationStartedData { targets })
    }

    pub fn compensation_step_requested(
        step: Step,
        resource_id: impl Into<String>,
        idempotency_key: IdempotencyKey,
    ) -> Self {
        SagaEvent::CompensationStepRequested(CompensationStepRequestedData {
            step,
            resource_id: resource_id.into(),
            idempotency_key,
        })
    }

    pub fn compensation_step_completed(
        step: Step,
        resource_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        SagaEvent::CompensationStepCompleted(CompensationStepData {
            step,
            resource_id: resource_id.into(),
            status: status.into(),
        })
    }

    pub fn compensation_step_failed(failure: CompensationFailure) -> Self {
        SagaEvent::CompensationStepFailed(failure)
    }

    pub fn compensation_finished(failures: usize) -> Self {
        SagaEvent::CompensationFinished(CompensationFinishedData {
            failures,
            finished_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn request() -> OrderRequest {
        OrderRequest {
            user_id: "user-1".to_string(),
            event_id: "event-1".to_string(),
            market_id: "market-1".to_string(),
            selection_id: "selection-1".to_string(),
            side: "BACK".to_string(),
            odds: dec!(2.5),
            stake: dec!(100),
            currency: "USD".to_string(),
            idempotency_key: "client-key-1".to_string(),
            metadata: None,
        }
    }

    #[test]
    fn test_event_type_and_target_state() {
        let saga_id = SagaId::new();

        let cases = [
            (SagaEvent::saga_started(saga_id, request()), "SagaStarted", None),
            (
                SagaEvent::validation_started(),
                "ValidationStarted",
                Some(SagaState::Validating),
            ),
            (
                SagaEvent::validation_passed(dec!(100)),
                "ValidationPassed",
                Some(SagaState::Reserving),
            ),
            (
                SagaEvent::placement_requested(
                    IdempotencyKey::derive(saga_id, Step::Order),
                    "res-1",
                ),
                "PlacementRequested",
                Some(SagaState::Matching),
            ),
            (
                SagaEvent::reservation_committed("COMMITTED"),
                "ReservationCommitted",
                Some(SagaState::Settled),
            ),
            (
                SagaEvent::step_failed(Step::Order, "market closed", FailureKind::FatalDownstream, false),
                "StepFailed",
                Some(SagaState::Failed),
            ),
            (
                SagaEvent::saga_cancelled("cancelled by user"),
                "SagaCancelled",
                Some(SagaState::Cancelled),
            ),
            (
                SagaEvent::call_reissued(Step::Reserve, IdempotencyKey::derive(saga_id, Step::Reserve)),
                "CallReissued",
                None,
            ),
            (
                SagaEvent::compensation_step_requested(
                    Step::CancelReservation,
                    "res-1",
                    IdempotencyKey::derive(saga_id, Step::CancelReservation),
                ),
                "CompensationStepRequested",
                None,
            ),
            (SagaEvent::compensation_finished(0), "CompensationFinished", None),
        ];

        for (event, event_type, target) in cases {
            assert_eq!(event.event_type(), event_type);
            assert_eq!(event.target_state(), target, "{event_type}");
        }
    }

    #[test]
    fn test_step_failed_reason_carries_context() {
        let SagaEvent::StepFailed(data) =
            SagaEvent::step_failed(Step::Reserve, "insufficient funds", FailureKind::FatalDownstream, false)
        else {
            panic!("Expected StepFailed event");
        };
        assert_eq!(data.reason, "fund reservation failed: insufficient funds");
    }

    #[test]
    fn test_saga_started_keeps_exact_decimals() {
        let saga_id = SagaId::new();
        let event = SagaEvent::saga_started(saga_id, request());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SagaStarted");
        assert_eq!(json["data"]["request"]["odds"], "2.5");
        assert_eq!(json["data"]["request"]["stake"], "100");

        let deserialized: SagaEvent = serde_json::from_value(json).unwrap();
        let SagaEvent::SagaStarted(data) = deserialized else {
            panic!("Expected SagaStarted event");
        };
        assert_eq!(data.saga_id, saga_id);
        assert_eq!(data.request, request());
    }

    #[test]
    fn test_compensation_failure_payload() {
        let event = SagaEvent::compensation_step_failed(CompensationFailure {
            step: Step::CancelReservation,
            resource_id: Some("res-1".to_string()),
            reason: "service returned 503 Service Unavailable".to_string(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["data"]["step"], "cancel-reservation");
        assert_eq!(json["data"]["resource_id"], "res-1");
    }
}
