//! Saga coordinator: drives one order placement through the state machine.

use async_trait::async_trait;
use chrono::Utc;
use common::SagaId;
use domain::{Aggregate, DomainEvent, OrderValidator};
use event_store::{AppendOptions, EventEnvelope, EventStore, EventStoreError, Version};
use serde::Serialize;
use tokio::sync::watch;

use crate::aggregate::{CompensationStatus, NextAction, SagaRecord};
use crate::compensation::{
    CompensationEngine, CompensationEntry, CompensationFailure, CompensationLog,
};
use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::gateway::{
    ActivityGateway, FundsService, MatchingService, PlaceOrder, ReserveFunds, ResourceCall,
    StepFailure, StepOutcome,
};
use crate::idempotency::{IdempotencyKey, Step};
use crate::state::{FailureKind, SagaState};

/// Cancellation request for one running saga.
///
/// Checked only between steps; a call already in flight always finishes.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Option<watch::Receiver<bool>>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self(None)
    }

    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self(Some(receiver))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// What the caller learns once a saga stops moving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaOutcome {
    pub saga_id: SagaId,
    pub state: SagaState,
    pub reservation_id: Option<String>,
    pub order_id: Option<String>,
    pub match_id: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Rollback problems, reported apart from the failure reason.
    pub compensation_failures: Vec<CompensationFailure>,
}

impl SagaOutcome {
    fn from_record(saga_id: SagaId, record: &SagaRecord) -> Self {
        Self {
            saga_id,
            state: record.state(),
            reservation_id: record.reservation_id().map(str::to_string),
            order_id: record.order_id().map(str::to_string),
            match_id: record.match_id().map(str::to_string),
            failure_reason: record.failure_reason().map(str::to_string),
            failure_kind: record.failure_kind(),
            compensation_failures: record.compensation_failures().to_vec(),
        }
    }

    pub fn requires_attention(&self) -> bool {
        !self.compensation_failures.is_empty()
    }
}

/// Orchestrates order placement sagas.
///
/// Validate, reserve, place and commit run strictly in sequence. Every
/// transition and call intent is appended to the saga's stream before the
/// call is made, with the version last seen, so a saga can be resumed
/// after a crash and two coordinators can never both advance it.
///
/// A logged call with no answer yet belongs to whoever logged it until its
/// lease runs out (the call's worst-case retry time plus one timeout). A
/// resume that finds such a call waits out the lease before re-issuing it.
pub struct SagaCoordinator<S, F, M> {
    store: S,
    gateway: ActivityGateway<F, M>,
    validator: OrderValidator,
}

impl<S, F, M> SagaCoordinator<S, F, M>
where
    S: EventStore,
    F: FundsService,
    M: MatchingService,
{
    pub fn new(store: S, gateway: ActivityGateway<F, M>, validator: OrderValidator) -> Self {
        Self {
            store,
            gateway,
            validator,
        }
    }

    /// Builds a coordinator with policies and limits taken from `config`.
    pub fn from_config(store: S, funds: F, matching: M, config: &SagaConfig) -> Self {
        let gateway = ActivityGateway::new(
            funds,
            matching,
            config.forward_policy(),
            config.compensation_policy(),
        );
        Self::new(store, gateway, OrderValidator::new(config.limits))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gateway(&self) -> &ActivityGateway<F, M> {
        &self.gateway
    }

    /// Records a new saga in `Pending`. Nothing downstream is called.
    #[tracing::instrument(skip(self, request), fields(%saga_id))]
    pub async fn start(&self, saga_id: SagaId, request: domain::OrderRequest) -> Result<SagaRecord> {
        let mut record = SagaRecord::default();
        match self
            .append(saga_id, &mut record, SagaEvent::saga_started(saga_id, request))
            .await
        {
            Err(SagaError::EventStore(EventStoreError::ConcurrencyConflict { .. })) => {
                return Err(SagaError::AlreadyExists(saga_id));
            }
            other => other?,
        }
        metrics::counter!("saga_started_total").increment(1);
        tracing::info!("saga started");
        Ok(record)
    }

    /// Starts a saga and drives it to the end.
    pub async fn execute(
        &self,
        saga_id: SagaId,
        request: domain::OrderRequest,
        cancel: CancelSignal,
    ) -> Result<SagaOutcome> {
        self.start(saga_id, request).await?;
        self.resume(saga_id, cancel).await
    }

    /// Continues a saga from whatever its log says happened last.
    ///
    /// Settled and fully compensated sagas are returned as they are. If
    /// another coordinator wrote first, this returns a conflict without
    /// having called anything downstream.
    #[tracing::instrument(skip(self, cancel), fields(%saga_id))]
    pub async fn resume(&self, saga_id: SagaId, cancel: CancelSignal) -> Result<SagaOutcome> {
        let mut record = self.load(saga_id).await?;
        if record.is_finalized() {
            return Ok(SagaOutcome::from_record(saga_id, &record));
        }

        while let Some(wait) = self.lease_remaining(&record) {
            tracing::info!(
                step = ?record.pending_call(),
                wait_ms = wait.as_millis() as u64,
                "call in flight under another coordinator; waiting for its lease"
            );
            tokio::time::sleep(wait).await;
            record = self.load(saga_id).await?;
            if record.is_finalized() {
                return Ok(SagaOutcome::from_record(saga_id, &record));
            }
        }

        let was_terminal = record.state().is_terminal();
        loop {
            match record.next_action() {
                NextAction::Validate => self.validate(saga_id, &mut record).await?,
                NextAction::Reserve => {
                    if !record.reservation_requested() && cancel.is_cancelled() {
                        self.cancel(saga_id, &mut record).await?;
                    } else {
                        self.reserve(saga_id, &mut record).await?;
                    }
                }
                NextAction::PlaceOrder => {
                    if record.state() == SagaState::Reserving && cancel.is_cancelled() {
                        self.cancel(saga_id, &mut record).await?;
                    } else {
                        self.place_order(saga_id, &mut record).await?;
                    }
                }
                NextAction::Commit => {
                    if !record.commit_requested() && cancel.is_cancelled() {
                        self.cancel(saga_id, &mut record).await?;
                    } else {
                        self.commit(saga_id, &mut record).await?;
                    }
                }
                NextAction::Compensate => self.compensate(saga_id, &mut record).await?,
                NextAction::Done => break,
            }
        }

        if !was_terminal {
            Self::record_finish(saga_id, &record);
        }
        Ok(SagaOutcome::from_record(saga_id, &record))
    }

    /// Resumes every saga whose log shows unfinished work.
    ///
    /// A saga that fails to resume is logged and skipped so one bad stream
    /// cannot block the others.
    pub async fn recover_incomplete(&self) -> Result<Vec<SagaOutcome>> {
        let mut outcomes = Vec::new();
        for saga_id in self.incomplete_sagas().await? {
            match self.resume(saga_id, CancelSignal::never()).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_conflict() => {
                    tracing::info!(%saga_id, "saga is being resumed elsewhere");
                }
                Err(e) => {
                    tracing::error!(%saga_id, error = %e, "failed to resume saga");
                }
            }
        }
        Ok(outcomes)
    }

    /// IDs of sagas with work left, oldest first.
    pub async fn incomplete_sagas(&self) -> Result<Vec<SagaId>> {
        let mut incomplete = Vec::new();
        for saga_id in self.store.stream_ids(SagaRecord::aggregate_type()).await? {
            if let Some(record) = self.get_saga(saga_id).await?
                && !record.is_finalized()
            {
                incomplete.push(saga_id);
            }
        }
        Ok(incomplete)
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaRecord> {
        self.get_saga(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// Time left before the record's unanswered call may be re-issued.
    fn lease_remaining(&self, record: &SagaRecord) -> Option<std::time::Duration> {
        let step = record.pending_call()?;
        let logged_at = record.updated_at()?;
        let age = (Utc::now() - logged_at).to_std().unwrap_or_default();
        self.gateway
            .call_lease(step)
            .checked_sub(age)
            .filter(|wait| !wait.is_zero())
    }

    /// Rebuilds a saga's record from its log.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        let events = self.store.load_stream(saga_id).await?;
        if events.is_empty() {
            return Ok(None);
        }

        let mut record = SagaRecord::default();
        for envelope in events {
            let event: SagaEvent = serde_json::from_value(envelope.payload)?;
            record.apply(event);
            record.set_version(envelope.version);
            record.set_updated_at(envelope.timestamp);
        }
        Ok(Some(record))
    }

    /// The raw log of one saga.
    pub async fn saga_events(&self, saga_id: SagaId) -> Result<Vec<EventEnvelope>> {
        Ok(self.store.load_stream(saga_id).await?)
    }

    async fn validate(&self, saga_id: SagaId, record: &mut SagaRecord) -> Result<()> {
        if record.state() == SagaState::Pending {
            self.append(saga_id, record, SagaEvent::validation_started())
                .await?;
        }
        let request = record
            .request()
            .cloned()
            .ok_or(SagaError::MissingRequest(saga_id))?;

        match self.validator.check(&request) {
            Ok(()) => {
                let amount = request.liability()?;
                self.append(saga_id, record, SagaEvent::validation_passed(amount))
                    .await
            }
            Err(reason) => {
                metrics::counter!("order_validation_rejected_total", "reason" => reason.code())
                    .increment(1);
                tracing::warn!(%reason, "order rejected by validation");
                self.append(
                    saga_id,
                    record,
                    SagaEvent::validation_rejected(reason.to_string(), reason.code()),
                )
                .await
            }
        }
    }

    async fn reserve(&self, saga_id: SagaId, record: &mut SagaRecord) -> Result<()> {
        let request = record
            .request()
            .cloned()
            .ok_or(SagaError::MissingRequest(saga_id))?;
        let amount = match record.reserved_amount() {
            Some(amount) => amount,
            None => request.liability()?,
        };
        let key = IdempotencyKey::derive(saga_id, Step::Reserve);

        let intent = if record.reservation_requested() {
            SagaEvent::call_reissued(Step::Reserve, key.clone())
        } else {
            SagaEvent::reservation_requested(key.clone(), amount, &request.currency)
        };
        self.append(saga_id, record, intent).await?;

        tracing::info!(step = %Step::Reserve, %amount, "saga step started");
        let outcome = self
            .gateway
            .reserve_funds(&ReserveFunds {
                user_id: request.user_id,
                amount,
                currency: request.currency,
                saga_id,
                idempotency_key: key,
            })
            .await;

        match outcome {
            StepOutcome::Success(reservation) => {
                self.append(
                    saga_id,
                    record,
                    SagaEvent::funds_reserved(reservation.reservation_id),
                )
                .await
            }
            StepOutcome::RetryableFailure(failure) | StepOutcome::FatalFailure(failure) => {
                self.fail(saga_id, record, Step::Reserve, failure).await
            }
        }
    }

    async fn place_order(&self, saga_id: SagaId, record: &mut SagaRecord) -> Result<()> {
        let request = record
            .request()
            .cloned()
            .ok_or(SagaError::MissingRequest(saga_id))?;
        let reservation_id = record
            .reservation_id()
            .map(str::to_string)
            .ok_or(SagaError::InvalidTransition {
                from: record.state(),
                to: SagaState::Matching,
            })?;
        let key = IdempotencyKey::derive(saga_id, Step::Order);

        let intent = if record.state() == SagaState::Reserving {
            SagaEvent::placement_requested(key.clone(), &reservation_id)
        } else {
            SagaEvent::call_reissued(Step::Order, key.clone())
        };
        self.append(saga_id, record, intent).await?;

        tracing::info!(step = %Step::Order, %reservation_id, "saga step started");
        let outcome = self
            .gateway
            .place_order(&PlaceOrder {
                side: request.side()?,
                user_id: request.user_id,
                event_id: request.event_id,
                market_id: request.market_id,
                selection_id: request.selection_id,
                odds: request.odds,
                stake: request.stake,
                currency: request.currency,
                reservation_id,
                saga_id,
                idempotency_key: key,
            })
            .await;

        match outcome {
            StepOutcome::Success(placement) => {
                self.append(
                    saga_id,
                    record,
                    SagaEvent::order_placed(placement.order_id, placement.match_id, placement.status),
                )
                .await
            }
            StepOutcome::RetryableFailure(failure) | StepOutcome::FatalFailure(failure) => {
                self.fail(saga_id, record, Step::Order, failure).await
            }
        }
    }

    async fn commit(&self, saga_id: SagaId, record: &mut SagaRecord) -> Result<()> {
        let reservation_id = record
            .reservation_id()
            .map(str::to_string)
            .ok_or(SagaError::InvalidTransition {
                from: record.state(),
                to: SagaState::Settled,
            })?;
        let key = IdempotencyKey::derive(saga_id, Step::Commit);

        let intent = if record.commit_requested() {
            SagaEvent::call_reissued(Step::Commit, key.clone())
        } else {
            SagaEvent::commit_requested(key.clone(), &reservation_id)
        };
        self.append(saga_id, record, intent).await?;

        tracing::info!(step = %Step::Commit, %reservation_id, "saga step started");
        let outcome = self
            .gateway
            .commit_reservation(&ResourceCall {
                resource_id: reservation_id,
                saga_id,
                idempotency_key: key,
            })
            .await;

        match outcome {
            StepOutcome::Success(ack) => {
                self.append(saga_id, record, SagaEvent::reservation_committed(ack.status))
                    .await
            }
            StepOutcome::RetryableFailure(failure) | StepOutcome::FatalFailure(failure) => {
                self.fail(saga_id, record, Step::Commit, failure).await
            }
        }
    }

    async fn fail(
        &self,
        saga_id: SagaId,
        record: &mut SagaRecord,
        step: Step,
        failure: StepFailure,
    ) -> Result<()> {
        let kind = if failure.retries_exhausted {
            FailureKind::RetryableTransport
        } else {
            FailureKind::FatalDownstream
        };
        tracing::warn!(
            %step,
            %kind,
            effect_unknown = failure.effect_unknown,
            error = %failure.message,
            "saga step failed"
        );
        self.append(
            saga_id,
            record,
            SagaEvent::step_failed(step, &failure.message, kind, failure.effect_unknown),
        )
        .await
    }

    async fn cancel(&self, saga_id: SagaId, record: &mut SagaRecord) -> Result<()> {
        tracing::info!(state = %record.state(), "saga cancelled between steps");
        self.append(saga_id, record, SagaEvent::saga_cancelled("cancelled by request"))
            .await
    }

    /// Runs whatever cancellations the log has not yet recorded.
    async fn compensate(&self, saga_id: SagaId, record: &mut SagaRecord) -> Result<()> {
        let targets = record.compensation_targets();
        if record.compensation() == CompensationStatus::Pending {
            self.append(saga_id, record, SagaEvent::compensation_started(targets.clone()))
                .await?;
        }

        let done = record.attempted_compensations();
        let report = CompensationEngine::new(&self.gateway)
            .compensate(
                saga_id,
                &targets,
                &done,
                &mut StreamLog {
                    coordinator: self,
                    saga_id,
                    record: &mut *record,
                },
            )
            .await?;
        if !report.is_clean() {
            tracing::warn!(
                failures = report.failures().count(),
                "rollback left resources for manual remediation"
            );
        }

        let failures = record.compensation_failures().len();
        self.append(saga_id, record, SagaEvent::compensation_finished(failures))
            .await
    }

    /// Appends one event at the record's next version and applies it.
    async fn append(
        &self,
        saga_id: SagaId,
        record: &mut SagaRecord,
        event: SagaEvent,
    ) -> Result<()> {
        if let Some(to) = event.target_state() {
            let from = record.state();
            if !from.can_transition_to(to) {
                return Err(SagaError::InvalidTransition { from, to });
            }
        }

        let current: Version = record.version();
        let envelope = EventEnvelope::builder()
            .event_type(event.event_type())
            .stream_id(saga_id)
            .stream_type(SagaRecord::aggregate_type())
            .version(current.next())
            .payload(&event)?
            .build()?;
        let timestamp = envelope.timestamp;

        let version = self
            .store
            .append(vec![envelope], AppendOptions::expect_version(current))
            .await?;

        record.apply(event);
        record.set_version(version);
        record.set_updated_at(timestamp);
        Ok(())
    }

    fn record_finish(saga_id: SagaId, record: &SagaRecord) {
        if let Some(created_at) = record.created_at() {
            let elapsed = (Utc::now() - created_at).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("saga_duration_seconds").record(elapsed);
        }

        match record.state() {
            SagaState::Settled => {
                metrics::counter!("saga_settled_total").increment(1);
                tracing::info!(
                    %saga_id,
                    reservation_id = record.reservation_id().unwrap_or_default(),
                    order_id = record.order_id().unwrap_or_default(),
                    "saga settled"
                );
            }
            SagaState::Cancelled => {
                metrics::counter!("saga_cancelled_total").increment(1);
                tracing::info!(%saga_id, "saga cancelled");
            }
            _ => {
                metrics::counter!("saga_failed_total").increment(1);
                tracing::warn!(
                    %saga_id,
                    reason = record.failure_reason().unwrap_or_default(),
                    "saga failed"
                );
            }
        }
    }
}

/// Writes the engine's rollback progress to the saga's own stream.
struct StreamLog<'a, S, F, M> {
    coordinator: &'a SagaCoordinator<S, F, M>,
    saga_id: SagaId,
    record: &'a mut SagaRecord,
}

#[async_trait]
impl<S, F, M> CompensationLog for StreamLog<'_, S, F, M>
where
    S: EventStore,
    F: FundsService,
    M: MatchingService,
{
    async fn step_requested(
        &mut self,
        step: Step,
        resource_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<()> {
        let event =
            SagaEvent::compensation_step_requested(step, resource_id, idempotency_key.clone());
        self.coordinator
            .append(self.saga_id, self.record, event)
            .await
    }

    async fn step_finished(&mut self, entry: &CompensationEntry) -> Result<()> {
        let event = match entry.clone() {
            CompensationEntry::Completed {
                step,
                resource_id,
                status,
            } => SagaEvent::compensation_step_completed(step, resource_id, status),
            CompensationEntry::Failed(failure) => SagaEvent::compensation_step_failed(failure),
        };
        self.coordinator
            .append(self.saga_id, self.record, event)
            .await
    }
}
