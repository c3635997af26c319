//! Rollback of a partially completed saga.

use async_trait::async_trait;
use common::SagaId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::gateway::{
    ActivityGateway, FundsService, MatchingService, ResourceCall, StepFailure, StepOutcome,
};
use crate::idempotency::{IdempotencyKey, Step};

/// Downstream resources a saga may be holding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationTargets {
    pub reservation_id: Option<String>,
    pub order_id: Option<String>,
    /// Reserve-funds may have succeeded without us learning the ID.
    #[serde(default)]
    pub reservation_unknown: bool,
    /// Place-order may have succeeded without us learning the ID.
    #[serde(default)]
    pub order_unknown: bool,
}

impl CompensationTargets {
    pub fn is_empty(&self) -> bool {
        self.reservation_id.is_none()
            && self.order_id.is_none()
            && !self.reservation_unknown
            && !self.order_unknown
    }

    /// Cancellations to run, order first, skipping those already `done`.
    pub fn plan(&self, done: &[Step]) -> Vec<Step> {
        let mut steps = Vec::with_capacity(2);
        if self.order_id.is_some() || self.order_unknown {
            steps.push(Step::CancelOrder);
        }
        if self.reservation_id.is_some() || self.reservation_unknown {
            steps.push(Step::CancelReservation);
        }
        steps.retain(|step| !done.contains(step));
        steps
    }

    fn resource(&self, step: Step) -> Option<&str> {
        match step {
            Step::CancelOrder => self.order_id.as_deref(),
            Step::CancelReservation => self.reservation_id.as_deref(),
            _ => None,
        }
    }
}

/// A cancellation that did not happen. Money or an order may be left
/// live downstream and someone has to look at it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{step} failed for {}: {reason}", .resource_id.as_deref().unwrap_or("unknown resource"))]
pub struct CompensationFailure {
    pub step: Step,
    /// None when the forward call's outcome was never learned.
    pub resource_id: Option<String>,
    pub reason: String,
}

/// Result of one cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationEntry {
    Completed {
        step: Step,
        resource_id: String,
        status: String,
    },
    Failed(CompensationFailure),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    pub entries: Vec<CompensationEntry>,
}

impl CompensationReport {
    pub fn failures(&self) -> impl Iterator<Item = &CompensationFailure> {
        self.entries.iter().filter_map(|entry| match entry {
            CompensationEntry::Failed(failure) => Some(failure),
            CompensationEntry::Completed { .. } => None,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Durable record of rollback progress, written as the engine goes.
///
/// Both methods must have persisted their fact before returning. An error
/// stops the rollback before the next downstream call.
#[async_trait]
pub trait CompensationLog: Send {
    /// Called immediately before a cancellation is sent.
    async fn step_requested(
        &mut self,
        step: Step,
        resource_id: &str,
        idempotency_key: &IdempotencyKey,
    ) -> Result<()>;

    /// Called with each cancellation's result, in the order they ran.
    async fn step_finished(&mut self, entry: &CompensationEntry) -> Result<()>;
}

/// Runs cancellations through the gateway's compensation policy.
///
/// Cancellations run order first, then reservation, and a failure of one
/// never stops the other.
pub struct CompensationEngine<'a, F, M> {
    gateway: &'a ActivityGateway<F, M>,
}

impl<'a, F, M> CompensationEngine<'a, F, M>
where
    F: FundsService,
    M: MatchingService,
{
    pub fn new(gateway: &'a ActivityGateway<F, M>) -> Self {
        Self { gateway }
    }

    /// Cancels everything in `targets` except the steps in `done`,
    /// recording each call in `log` before it is made and each result
    /// after.
    ///
    /// Cancellation problems land in the report. `Err` only comes from
    /// `log`.
    #[tracing::instrument(skip_all, fields(%saga_id))]
    pub async fn compensate<L>(
        &self,
        saga_id: SagaId,
        targets: &CompensationTargets,
        done: &[Step],
        log: &mut L,
    ) -> Result<CompensationReport>
    where
        L: CompensationLog,
    {
        let mut report = CompensationReport::default();
        for step in targets.plan(done) {
            let entry = match targets.resource(step) {
                Some(resource_id) => {
                    let key = IdempotencyKey::derive(saga_id, step);
                    log.step_requested(step, resource_id, &key).await?;
                    self.cancel(saga_id, step, resource_id, key).await
                }
                None => {
                    let failure = CompensationFailure {
                        step,
                        resource_id: None,
                        reason: "forward call outcome unknown and no identifier was returned; \
                                 manual reconciliation required"
                            .to_string(),
                    };
                    report_failure(saga_id, &failure);
                    CompensationEntry::Failed(failure)
                }
            };
            log.step_finished(&entry).await?;
            report.entries.push(entry);
        }
        Ok(report)
    }

    async fn cancel(
        &self,
        saga_id: SagaId,
        step: Step,
        resource_id: &str,
        idempotency_key: IdempotencyKey,
    ) -> CompensationEntry {
        let request = ResourceCall {
            resource_id: resource_id.to_string(),
            saga_id,
            idempotency_key,
        };
        let outcome = match step {
            Step::CancelOrder => self.gateway.cancel_order(&request).await,
            Step::CancelReservation => self.gateway.cancel_reservation(&request).await,
            _ => StepOutcome::FatalFailure(StepFailure::new(format!(
                "{step} is not a compensating step"
            ))),
        };

        match outcome {
            StepOutcome::Success(ack) => {
                tracing::info!(%step, %resource_id, status = %ack.status, "compensation step completed");
                CompensationEntry::Completed {
                    step,
                    resource_id: request.resource_id,
                    status: ack.status,
                }
            }
            StepOutcome::RetryableFailure(failure) | StepOutcome::FatalFailure(failure) => {
                let failure = CompensationFailure {
                    step,
                    resource_id: Some(request.resource_id),
                    reason: failure.message,
                };
                report_failure(saga_id, &failure);
                CompensationEntry::Failed(failure)
            }
        }
    }
}

fn report_failure(saga_id: SagaId, failure: &CompensationFailure) {
    metrics::counter!("saga_compensation_failures_total", "step" => failure.step.as_str())
        .increment(1);
    tracing::error!(
        %saga_id,
        step = %failure.step,
        resource_id = failure.resource_id.as_deref().unwrap_or("unknown"),
        reason = %failure.reason,
        alert = true,
        "compensation failed; manual remediation required"
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use event_store::{EventStoreError, Version};

    use super::*;
    use crate::error::SagaError;
    use crate::gateway::{
        CallLog, CallPolicy, InMemoryFundsService, InMemoryMatchingService, Operation,
        RetryPolicy, ScriptedFailure,
    };

    /// Keeps what the engine logged; refuses claims once `refuse_from`
    /// steps have been claimed.
    #[derive(Default)]
    struct RecordingLog {
        requested: Vec<(Step, String)>,
        finished: Vec<CompensationEntry>,
        refuse_from: Option<usize>,
    }

    #[async_trait]
    impl CompensationLog for RecordingLog {
        async fn step_requested(
            &mut self,
            step: Step,
            resource_id: &str,
            _idempotency_key: &IdempotencyKey,
        ) -> Result<()> {
            if self.refuse_from == Some(self.requested.len()) {
                return Err(SagaError::EventStore(EventStoreError::ConcurrencyConflict {
                    stream_id: SagaId::new(),
                    expected: Version::first(),
                    actual: Version::new(2),
                }));
            }
            self.requested.push((step, resource_id.to_string()));
            Ok(())
        }

        async fn step_finished(&mut self, entry: &CompensationEntry) -> Result<()> {
            self.finished.push(entry.clone());
            Ok(())
        }
    }

    fn gateway() -> (
        ActivityGateway<InMemoryFundsService, InMemoryMatchingService>,
        CallLog,
    ) {
        let log = CallLog::new();
        let funds = InMemoryFundsService::with_call_log(log.clone());
        let matching = InMemoryMatchingService::with_call_log(log.clone());
        let policy = CallPolicy::new(
            Duration::from_millis(50),
            RetryPolicy {
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 1.0,
                max_interval: Duration::from_millis(1),
                max_attempts: 2,
            },
        );
        (
            ActivityGateway::new(funds, matching, policy.clone(), policy),
            log,
        )
    }

    fn both() -> CompensationTargets {
        CompensationTargets {
            reservation_id: Some("res-1".to_string()),
            order_id: Some("ord-1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_runs_order_before_reservation() {
        assert_eq!(
            both().plan(&[]),
            vec![Step::CancelOrder, Step::CancelReservation]
        );
        assert_eq!(both().plan(&[Step::CancelOrder]), vec![Step::CancelReservation]);
        assert!(CompensationTargets::default().plan(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_cancels_order_then_reservation() {
        let (gateway, calls) = gateway();
        let saga_id = SagaId::new();
        let mut log = RecordingLog::default();

        let report = CompensationEngine::new(&gateway)
            .compensate(saga_id, &both(), &[], &mut log)
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(
            calls.operations(),
            vec![Operation::CancelOrder, Operation::CancelReservation]
        );
        let records = calls.records();
        assert_eq!(
            records[0].idempotency_key,
            format!("{saga_id}-cancel-order")
        );
        assert_eq!(
            records[1].idempotency_key,
            format!("{saga_id}-cancel-reservation")
        );
        assert_eq!(
            log.requested,
            vec![
                (Step::CancelOrder, "ord-1".to_string()),
                (Step::CancelReservation, "res-1".to_string()),
            ]
        );
        assert_eq!(log.finished, report.entries);
    }

    #[tokio::test]
    async fn test_failed_order_cancel_does_not_block_reservation_cancel() {
        let (gateway, calls) = gateway();
        gateway.matching().fail_always(
            Operation::CancelOrder,
            ScriptedFailure::Fatal("order book locked".to_string()),
        );

        let report = CompensationEngine::new(&gateway)
            .compensate(SagaId::new(), &both(), &[], &mut RecordingLog::default())
            .await
            .unwrap();

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, Step::CancelOrder);
        assert_eq!(failures[0].resource_id.as_deref(), Some("ord-1"));
        assert_eq!(calls.count(Operation::CancelReservation), 1);
    }

    #[tokio::test]
    async fn test_compensation_retries_once_then_reports() {
        let (gateway, calls) = gateway();
        gateway.funds().fail_always(
            Operation::CancelReservation,
            ScriptedFailure::Retryable("funds service unavailable".to_string()),
        );
        let targets = CompensationTargets {
            reservation_id: Some("res-1".to_string()),
            ..Default::default()
        };

        let report = CompensationEngine::new(&gateway)
            .compensate(SagaId::new(), &targets, &[], &mut RecordingLog::default())
            .await
            .unwrap();

        assert!(!report.is_clean());
        assert_eq!(calls.count(Operation::CancelReservation), 2);
        assert_eq!(calls.count(Operation::CancelOrder), 0);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_reported_without_a_call() {
        let (gateway, calls) = gateway();
        let targets = CompensationTargets {
            reservation_id: Some("res-1".to_string()),
            order_unknown: true,
            ..Default::default()
        };
        let mut log = RecordingLog::default();

        let report = CompensationEngine::new(&gateway)
            .compensate(SagaId::new(), &targets, &[], &mut log)
            .await
            .unwrap();

        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].step, Step::CancelOrder);
        assert!(failures[0].resource_id.is_none());
        assert_eq!(calls.operations(), vec![Operation::CancelReservation]);
        assert_eq!(log.requested.len(), 1);
        assert_eq!(log.finished.len(), 2);
    }

    #[tokio::test]
    async fn test_refused_claim_stops_before_the_call() {
        let (gateway, calls) = gateway();
        let mut log = RecordingLog {
            refuse_from: Some(1),
            ..Default::default()
        };

        let result = CompensationEngine::new(&gateway)
            .compensate(SagaId::new(), &both(), &[], &mut log)
            .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.operations(), vec![Operation::CancelOrder]);
        assert_eq!(log.finished.len(), 1);
    }

    #[test]
    fn test_failure_message_names_the_resource() {
        let failure = CompensationFailure {
            step: Step::CancelReservation,
            resource_id: Some("res-7".to_string()),
            reason: "timed out".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "cancel-reservation failed for res-7: timed out"
        );
    }
}
