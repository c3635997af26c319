//! Saga record rebuilt from the saga log.

use chrono::{DateTime, Utc};
use common::SagaId;
use domain::{Aggregate, OrderRequest};
use event_store::Version;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::compensation::{CompensationFailure, CompensationTargets};
use crate::events::SagaEvent;
use crate::gateway::OrderStatus;
use crate::idempotency::Step;
use crate::state::{FailureKind, SagaState};

/// Progress of the rollback phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    /// Nothing is held downstream.
    #[default]
    NotRequired,
    /// The saga failed holding something; rollback has not begun.
    Pending,
    InProgress,
    Completed,
    /// Every cancellation was attempted and at least one failed.
    CompletedWithFailures,
}

/// What the coordinator must do next for a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Validate,
    Reserve,
    PlaceOrder,
    Commit,
    Compensate,
    Done,
}

/// One order placement attempt, as far as the log knows.
///
/// Only the coordinator writes events for a saga; this record is the fold
/// of those events and never changes any other way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaRecord {
    id: Option<SagaId>,
    version: Version,
    state: SagaState,
    request: Option<OrderRequest>,
    reserved_amount: Option<Decimal>,
    reservation_requested: bool,
    commit_requested: bool,
    /// Call logged as requested whose answer is not in the log yet.
    pending_call: Option<Step>,
    reservation_id: Option<String>,
    order_id: Option<String>,
    match_id: Option<String>,
    order_status: Option<OrderStatus>,
    failed_step: Option<Step>,
    failure_reason: Option<String>,
    failure_kind: Option<FailureKind>,
    reservation_unknown: bool,
    order_unknown: bool,
    compensation: CompensationStatus,
    compensated_steps: Vec<Step>,
    compensation_failures: Vec<CompensationFailure>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
}

impl Aggregate for SagaRecord {
    type Event = SagaEvent;

    fn aggregate_type() -> &'static str {
        "OrderPlacementSaga"
    }

    fn id(&self) -> Option<SagaId> {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        if let Some(state) = event.target_state() {
            self.state = state;
        }

        match event {
            SagaEvent::SagaStarted(data) => {
                self.id = Some(data.saga_id);
                self.request = Some(data.request);
                self.created_at = Some(data.started_at);
                self.updated_at = Some(data.started_at);
            }
            SagaEvent::ValidationStarted(_) => {}
            SagaEvent::ValidationPassed(data) => {
                self.reserved_amount = Some(data.amount);
            }
            SagaEvent::ValidationRejected(data) => {
                self.failure_reason = Some(data.reason);
                self.failure_kind = Some(FailureKind::Validation);
            }
            SagaEvent::ReservationRequested(_) => {
                self.reservation_requested = true;
                self.pending_call = Some(Step::Reserve);
            }
            SagaEvent::FundsReserved(data) => {
                self.reservation_id = Some(data.reservation_id);
                self.pending_call = None;
            }
            SagaEvent::PlacementRequested(_) => {
                self.pending_call = Some(Step::Order);
            }
            SagaEvent::OrderPlaced(data) => {
                self.pending_call = None;
                self.order_id = Some(data.order_id);
                self.match_id = data.match_id;
                self.order_status = Some(data.status);
            }
            SagaEvent::CommitRequested(_) => {
                self.commit_requested = true;
                self.pending_call = Some(Step::Commit);
            }
            SagaEvent::ReservationCommitted(data) => {
                self.settled_at = Some(data.settled_at);
                self.pending_call = None;
            }
            SagaEvent::CallReissued(data) => {
                self.pending_call = Some(data.step);
            }
            SagaEvent::StepFailed(data) => {
                self.pending_call = None;
                if data.effect_unknown {
                    match data.step {
                        Step::Reserve => self.reservation_unknown = self.reservation_id.is_none(),
                        Step::Order => self.order_unknown = self.order_id.is_none(),
                        _ => {}
                    }
                }
                self.failed_step = Some(data.step);
                self.failure_reason = Some(data.reason);
                self.failure_kind = Some(data.kind);
                self.compensation = self.pending_compensation();
            }
            SagaEvent::SagaCancelled(data) => {
                self.failure_reason = Some(data.reason);
                self.failure_kind = Some(FailureKind::Cancelled);
                self.compensation = self.pending_compensation();
            }
            SagaEvent::CompensationStarted(_) => {
                self.compensation = CompensationStatus::InProgress;
            }
            SagaEvent::CompensationStepRequested(data) => {
                self.pending_call = Some(data.step);
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.compensated_steps.push(data.step);
                self.pending_call = None;
            }
            SagaEvent::CompensationStepFailed(failure) => {
                self.compensation_failures.push(failure);
                self.pending_call = None;
            }
            SagaEvent::CompensationFinished(_) => {
                self.compensation = if self.compensation_failures.is_empty() {
                    CompensationStatus::Completed
                } else {
                    CompensationStatus::CompletedWithFailures
                };
            }
        }
    }
}

impl SagaRecord {
    fn pending_compensation(&self) -> CompensationStatus {
        if self.compensation_targets().is_empty() {
            CompensationStatus::NotRequired
        } else {
            CompensationStatus::Pending
        }
    }

    /// Records when the last applied event was written.
    pub fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }

    /// Decides the next step from the record alone, so a resumed saga
    /// continues exactly where the log says it stopped.
    pub fn next_action(&self) -> NextAction {
        match self.state {
            SagaState::Pending | SagaState::Validating => NextAction::Validate,
            SagaState::Reserving if self.reservation_id.is_none() => NextAction::Reserve,
            SagaState::Reserving => NextAction::PlaceOrder,
            SagaState::Matching if self.order_id.is_none() => NextAction::PlaceOrder,
            SagaState::Matching => NextAction::Commit,
            SagaState::Settled => NextAction::Done,
            SagaState::Failed | SagaState::Cancelled => match self.compensation {
                CompensationStatus::Pending | CompensationStatus::InProgress => {
                    NextAction::Compensate
                }
                _ => NextAction::Done,
            },
        }
    }

    /// True once nothing is left to do for this saga.
    pub fn is_finalized(&self) -> bool {
        self.next_action() == NextAction::Done
    }

    /// Resources that must be released if the saga does not settle.
    pub fn compensation_targets(&self) -> CompensationTargets {
        CompensationTargets {
            reservation_id: self.reservation_id.clone(),
            order_id: self.order_id.clone(),
            reservation_unknown: self.reservation_unknown,
            order_unknown: self.order_unknown,
        }
    }

    /// Cancellations already attempted, successful or not.
    pub fn attempted_compensations(&self) -> Vec<Step> {
        self.compensated_steps
            .iter()
            .copied()
            .chain(self.compensation_failures.iter().map(|f| f.step))
            .collect()
    }

    /// True when a failed rollback left something for operators.
    pub fn requires_attention(&self) -> bool {
        !self.compensation_failures.is_empty()
    }
}

// Query methods
impl SagaRecord {
    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn request(&self) -> Option<&OrderRequest> {
        self.request.as_ref()
    }

    pub fn reserved_amount(&self) -> Option<Decimal> {
        self.reserved_amount
    }

    pub fn reservation_requested(&self) -> bool {
        self.reservation_requested
    }

    pub fn commit_requested(&self) -> bool {
        self.commit_requested
    }

    /// The call a coordinator logged and has not yet answered. When it is
    /// set, the last event in the log is that call's request.
    pub fn pending_call(&self) -> Option<Step> {
        self.pending_call
    }

    pub fn reservation_id(&self) -> Option<&str> {
        self.reservation_id.as_deref()
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order_id.as_deref()
    }

    pub fn match_id(&self) -> Option<&str> {
        self.match_id.as_deref()
    }

    pub fn order_status(&self) -> Option<OrderStatus> {
        self.order_status
    }

    pub fn failed_step(&self) -> Option<Step> {
        self.failed_step
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure_kind
    }

    pub fn compensation(&self) -> CompensationStatus {
        self.compensation
    }

    pub fn compensated_steps(&self) -> &[Step] {
        &self.compensated_steps
    }

    pub fn compensation_failures(&self) -> &[CompensationFailure] {
        &self.compensation_failures
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn settled_at(&self) -> Option<DateTime<Utc>> {
        self.settled_at
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::idempotency::IdempotencyKey;

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

    fn reserved(saga_id: SagaId) -> SagaRecord {
        let mut record = SagaRecord::default();
        record.apply_events([
            SagaEvent::saga_started(saga_id, request()),
            SagaEvent::validation_started(),
            SagaEvent::validation_passed(dec!(100)),
            SagaEvent::reservation_requested(
                IdempotencyKey::derive(saga_id, Step::Reserve),
                dec!(100),
                "USD",
            ),
            SagaEvent::funds_reserved("res-1"),
        ]);
        record
    }

    #[test]
    fn test_default_record() {
        let record = SagaRecord::default();
        assert!(record.id().is_none());
        assert_eq!(record.state(), SagaState::Pending);
        assert_eq!(record.next_action(), NextAction::Validate);
    }

    #[test]
    fn test_happy_path_fold() {
        let saga_id = SagaId::new();
        let mut record = reserved(saga_id);
        assert_eq!(record.id(), Some(saga_id));
        assert_eq!(record.state(), SagaState::Reserving);
        assert_eq!(record.reserved_amount(), Some(dec!(100)));
        assert_eq!(record.next_action(), NextAction::PlaceOrder);

        record.apply(SagaEvent::placement_requested(
            IdempotencyKey::derive(saga_id, Step::Order),
            "res-1",
        ));
        assert_eq!(record.state(), SagaState::Matching);
        assert_eq!(record.next_action(), NextAction::PlaceOrder);

        record.apply(SagaEvent::order_placed(
            "ord-1",
            Some("match-1".to_string()),
            OrderStatus::Matched,
        ));
        assert_eq!(record.next_action(), NextAction::Commit);

        record.apply(SagaEvent::reservation_committed("COMMITTED"));
        assert_eq!(record.state(), SagaState::Settled);
        assert_eq!(record.match_id(), Some("match-1"));
        assert!(record.settled_at().is_some());
        assert!(record.is_finalized());
        assert_eq!(record.compensation(), CompensationStatus::NotRequired);
    }

    #[test]
    fn test_validation_rejection_needs_no_compensation() {
        let mut record = SagaRecord::default();
        record.apply_events([
            SagaEvent::saga_started(SagaId::new(), request()),
            SagaEvent::validation_started(),
            SagaEvent::validation_rejected("stake too low: minimum is 1", "stake_too_low"),
        ]);

        assert_eq!(record.state(), SagaState::Failed);
        assert_eq!(record.failure_kind(), Some(FailureKind::Validation));
        assert_eq!(record.failure_reason(), Some("stake too low: minimum is 1"));
        assert!(record.is_finalized());
    }

    #[test]
    fn test_reserve_failure_without_effect_needs_no_compensation() {
        let saga_id = SagaId::new();
        let mut record = SagaRecord::default();
        record.apply_events([
            SagaEvent::saga_started(saga_id, request()),
            SagaEvent::validation_started(),
            SagaEvent::validation_passed(dec!(100)),
            SagaEvent::step_failed(Step::Reserve, "insufficient funds", FailureKind::FatalDownstream, false),
        ]);

        assert_eq!(record.compensation(), CompensationStatus::NotRequired);
        assert!(record.is_finalized());
    }

    #[test]
    fn test_ambiguous_reserve_failure_is_compensated() {
        let saga_id = SagaId::new();
        let mut record = SagaRecord::default();
        record.apply_events([
            SagaEvent::saga_started(saga_id, request()),
            SagaEvent::validation_started(),
            SagaEvent::validation_passed(dec!(100)),
            SagaEvent::step_failed(Step::Reserve, "timed out", FailureKind::RetryableTransport, true),
        ]);

        assert_eq!(record.compensation(), CompensationStatus::Pending);
        assert!(record.compensation_targets().reservation_unknown);
        assert_eq!(record.next_action(), NextAction::Compensate);
    }

    #[test]
    fn test_failed_placement_then_compensation() {
        let saga_id = SagaId::new();
        let mut record = reserved(saga_id);
        record.apply(SagaEvent::placement_requested(
            IdempotencyKey::derive(saga_id, Step::Order),
            "res-1",
        ));
        record.apply(SagaEvent::step_failed(
            Step::Order,
            "market closed",
            FailureKind::FatalDownstream,
            false,
        ));

        assert_eq!(record.state(), SagaState::Failed);
        assert_eq!(record.failure_reason(), Some("order placement failed: market closed"));
        assert_eq!(record.next_action(), NextAction::Compensate);
        assert_eq!(
            record.compensation_targets().plan(&record.attempted_compensations()),
            vec![Step::CancelReservation]
        );

        record.apply(SagaEvent::compensation_started(record.compensation_targets()));
        assert_eq!(record.compensation(), CompensationStatus::InProgress);
        assert_eq!(record.next_action(), NextAction::Compensate);

        record.apply(SagaEvent::compensation_step_failed(CompensationFailure {
            step: Step::CancelReservation,
            resource_id: Some("res-1".to_string()),
            reason: "unavailable".to_string(),
        }));
        assert!(record.compensation_targets().plan(&record.attempted_compensations()).is_empty());

        record.apply(SagaEvent::compensation_finished(1));
        assert_eq!(record.compensation(), CompensationStatus::CompletedWithFailures);
        assert!(record.requires_attention());
        assert!(record.is_finalized());
    }

    #[test]
    fn test_cancel_while_reserving_with_nothing_held() {
        let mut record = SagaRecord::default();
        record.apply_events([
            SagaEvent::saga_started(SagaId::new(), request()),
            SagaEvent::validation_started(),
            SagaEvent::validation_passed(dec!(100)),
            SagaEvent::saga_cancelled("cancelled by user"),
        ]);

        assert_eq!(record.state(), SagaState::Cancelled);
        assert_eq!(record.failure_kind(), Some(FailureKind::Cancelled));
        assert!(record.is_finalized());
    }

    #[test]
    fn test_pending_call_tracks_unanswered_requests() {
        let saga_id = SagaId::new();
        let mut record = reserved(saga_id);
        assert_eq!(record.pending_call(), None);

        record.apply(SagaEvent::placement_requested(
            IdempotencyKey::derive(saga_id, Step::Order),
            "res-1",
        ));
        assert_eq!(record.pending_call(), Some(Step::Order));

        record.apply(SagaEvent::call_reissued(
            Step::Order,
            IdempotencyKey::derive(saga_id, Step::Order),
        ));
        assert_eq!(record.pending_call(), Some(Step::Order));
        assert_eq!(record.state(), SagaState::Matching);

        record.apply(SagaEvent::step_failed(
            Step::Order,
            "market closed",
            FailureKind::FatalDownstream,
            false,
        ));
        assert_eq!(record.pending_call(), None);

        record.apply(SagaEvent::compensation_started(record.compensation_targets()));
        record.apply(SagaEvent::compensation_step_requested(
            Step::CancelReservation,
            "res-1",
            IdempotencyKey::derive(saga_id, Step::CancelReservation),
        ));
        assert_eq!(record.pending_call(), Some(Step::CancelReservation));
        assert_eq!(
            record.compensation_targets().plan(&record.attempted_compensations()),
            vec![Step::CancelReservation]
        );

        record.apply(SagaEvent::compensation_step_completed(
            Step::CancelReservation,
            "res-1",
            "CANCELLED",
        ));
        assert_eq!(record.pending_call(), None);
    }
}
