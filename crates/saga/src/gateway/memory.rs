//! In-memory funds and matching services.
//!
//! They behave like well-mannered downstream services: effects are
//! deduplicated by idempotency key and cancelling something that does not
//! exist is a no-op. Failures can be scripted per operation and every
//! physical attempt is written to a [`CallLog`] that can be shared between
//! both services to check cross-service ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{
    Acknowledgement, FundsService, MatchingService, Operation, OrderStatus, PlaceOrder, Placement,
    ReserveFunds, Reservation, ResourceCall, StepFailure, StepOutcome,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a scripted call misbehaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Reject with a transient error; nothing is applied.
    Retryable(String),
    /// Reject permanently; nothing is applied.
    Fatal(String),
    /// Apply the effect, then lose the answer.
    Ambiguous,
    /// Never answer; nothing is applied.
    Hang,
}

#[derive(Debug, Clone)]
struct Script {
    failure: ScriptedFailure,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct Scripts(HashMap<Operation, Script>);

impl Scripts {
    fn set(&mut self, operation: Operation, failure: ScriptedFailure, times: Option<usize>) {
        self.0.insert(
            operation,
            Script {
                failure,
                remaining: times,
            },
        );
    }

    fn take(&mut self, operation: Operation) -> Option<ScriptedFailure> {
        let script = self.0.get_mut(&operation)?;
        let failure = script.failure.clone();
        match script.remaining.as_mut() {
            Some(0) => {
                self.0.remove(&operation);
                return None;
            }
            Some(n) => *n -= 1,
            None => {}
        }
        Some(failure)
    }
}

/// One physical attempt against an in-memory service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: Operation,
    pub idempotency_key: String,
    /// Reservation or order the call targeted, when it had one.
    pub resource_id: Option<String>,
}

/// Ordered record of calls, shareable between services.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<CallRecord>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, operation: Operation, key: &str, resource_id: Option<&str>) {
        lock(&self.0).push(CallRecord {
            operation,
            idempotency_key: key.to_string(),
            resource_id: resource_id.map(str::to_string),
        });
    }

    pub fn records(&self) -> Vec<CallRecord> {
        lock(&self.0).clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.0).iter().map(|r| r.operation).collect()
    }

    pub fn count(&self, operation: Operation) -> usize {
        lock(&self.0)
            .iter()
            .filter(|r| r.operation == operation)
            .count()
    }

    pub fn calls_to(&self, operation: Operation) -> Vec<CallRecord> {
        lock(&self.0)
            .iter()
            .filter(|r| r.operation == operation)
            .cloned()
            .collect()
    }
}

/// Life of a reservation in the in-memory funds service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Held,
    Committed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct HeldFunds {
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: ReservationStatus,
}

#[derive(Debug, Default)]
struct FundsState {
    reservations: HashMap<String, HeldFunds>,
    reservation_by_key: HashMap<String, String>,
    next_id: u32,
    scripts: Scripts,
    latency: Option<Duration>,
}

/// In-memory funds service for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFundsService {
    state: Arc<Mutex<FundsState>>,
    log: CallLog,
}

impl InMemoryFundsService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records calls into `log` instead of a private one.
    pub fn with_call_log(log: CallLog) -> Self {
        Self {
            state: Arc::default(),
            log,
        }
    }

    pub fn call_log(&self) -> &CallLog {
        &self.log
    }

    /// Makes the next `times` calls of `operation` fail as scripted.
    pub fn fail_next(&self, operation: Operation, failure: ScriptedFailure, times: usize) {
        lock(&self.state)
            .scripts
            .set(operation, failure, Some(times));
    }

    /// Makes every call of `operation` fail as scripted.
    pub fn fail_always(&self, operation: Operation, failure: ScriptedFailure) {
        lock(&self.state).scripts.set(operation, failure, None);
    }

    /// Delays every call, to keep sagas in flight.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = Some(latency);
    }

    pub fn reservation(&self, reservation_id: &str) -> Option<HeldFunds> {
        lock(&self.state).reservations.get(reservation_id).cloned()
    }

    /// Number of distinct reservations ever created.
    pub fn reservation_count(&self) -> usize {
        lock(&self.state).reservations.len()
    }

    /// Number of reservations still holding funds.
    pub fn held_count(&self) -> usize {
        lock(&self.state)
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Held)
            .count()
    }

    async fn begin(&self, operation: Operation, key: &str, resource_id: Option<&str>) -> Option<ScriptedFailure> {
        self.log.push(operation, key, resource_id);
        let (latency, scripted) = {
            let mut state = lock(&self.state);
            (state.latency, state.scripts.take(operation))
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if scripted == Some(ScriptedFailure::Hang) {
            std::future::pending::<()>().await;
        }
        scripted
    }

    fn set_status(&self, request: &ResourceCall, status: ReservationStatus) -> Option<&'static str> {
        let mut state = lock(&self.state);
        let reservation = state.reservations.get_mut(&request.resource_id)?;
        match (reservation.status, status) {
            (ReservationStatus::Held, _) => reservation.status = status,
            (current, wanted) if current == wanted => {}
            (ReservationStatus::Committed, ReservationStatus::Cancelled) => {
                return Some("reservation already committed");
            }
            _ => return Some("reservation already cancelled"),
        }
        None
    }

    fn acknowledge(
        &self,
        request: &ResourceCall,
        status: ReservationStatus,
        scripted: Option<ScriptedFailure>,
        done: &str,
    ) -> StepOutcome<Acknowledgement> {
        if let Some(outcome) = rejection(&scripted) {
            return outcome;
        }
        let known = lock(&self.state)
            .reservations
            .contains_key(&request.resource_id);
        if !known {
            if status == ReservationStatus::Cancelled {
                // Nothing was held under this ID; releasing it is a no-op.
                return StepOutcome::Success(Acknowledgement {
                    status: "NOT_FOUND".to_string(),
                });
            }
            return StepOutcome::FatalFailure(StepFailure::new(format!(
                "reservation {} not found",
                request.resource_id
            )));
        }
        if let Some(conflict) = self.set_status(request, status) {
            return StepOutcome::FatalFailure(StepFailure::new(conflict));
        }
        answer(scripted, Acknowledgement {
            status: done.to_string(),
        })
    }
}

/// Returns the outcome for failures that apply nothing.
fn rejection<T>(scripted: &Option<ScriptedFailure>) -> Option<StepOutcome<T>> {
    match scripted {
        Some(ScriptedFailure::Retryable(message)) => Some(StepOutcome::RetryableFailure(
            StepFailure::new(message.clone()),
        )),
        Some(ScriptedFailure::Fatal(message)) => {
            Some(StepOutcome::FatalFailure(StepFailure::new(message.clone())))
        }
        _ => None,
    }
}

/// Wraps an applied effect, dropping the answer for ambiguous scripts.
fn answer<T>(scripted: Option<ScriptedFailure>, value: T) -> StepOutcome<T> {
    if scripted == Some(ScriptedFailure::Ambiguous) {
        return StepOutcome::RetryableFailure(StepFailure::ambiguous(
            "connection reset after request was sent",
        ));
    }
    StepOutcome::Success(value)
}

#[async_trait]
impl FundsService for InMemoryFundsService {
    async fn reserve_funds(&self, request: &ReserveFunds) -> StepOutcome<Reservation> {
        let key = request.idempotency_key.as_str();
        let scripted = self.begin(Operation::ReserveFunds, key, None).await;
        if let Some(outcome) = rejection(&scripted) {
            return outcome;
        }

        let reservation_id = {
            let mut state = lock(&self.state);
            match state.reservation_by_key.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    state.next_id += 1;
                    let id = format!("res-{:04}", state.next_id);
                    state.reservations.insert(
                        id.clone(),
                        HeldFunds {
                            user_id: request.user_id.clone(),
                            amount: request.amount,
                            currency: request.currency.clone(),
                            status: ReservationStatus::Held,
                        },
                    );
                    state.reservation_by_key.insert(key.to_string(), id.clone());
                    id
                }
            }
        };

        answer(scripted, Reservation {
            reservation_id,
            status: "RESERVED".to_string(),
        })
    }

    async fn commit_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        let scripted = self
            .begin(
                Operation::CommitReservation,
                request.idempotency_key.as_str(),
                Some(&request.resource_id),
            )
            .await;
        self.acknowledge(request, ReservationStatus::Committed, scripted, "COMMITTED")
    }

    async fn cancel_reservation(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        let scripted = self
            .begin(
                Operation::CancelReservation,
                request.idempotency_key.as_str(),
                Some(&request.resource_id),
            )
            .await;
        self.acknowledge(request, ReservationStatus::Cancelled, scripted, "CANCELLED")
    }
}

#[derive(Debug, Clone)]
pub struct BookedOrder {
    pub reservation_id: String,
    pub status: OrderStatus,
    pub match_id: Option<String>,
}

#[derive(Debug)]
struct MatchingState {
    orders: HashMap<String, BookedOrder>,
    order_by_key: HashMap<String, String>,
    next_id: u32,
    placement_status: OrderStatus,
    scripts: Scripts,
    latency: Option<Duration>,
}

impl Default for MatchingState {
    fn default() -> Self {
        Self {
            orders: HashMap::new(),
            order_by_key: HashMap::new(),
            next_id: 0,
            placement_status: OrderStatus::Matched,
            scripts: Scripts::default(),
            latency: None,
        }
    }
}

/// In-memory matching service. Orders match immediately unless told
/// otherwise with [`set_placement_status`](Self::set_placement_status).
#[derive(Debug, Clone, Default)]
pub struct InMemoryMatchingService {
    state: Arc<Mutex<MatchingState>>,
    log: CallLog,
}

impl InMemoryMatchingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_log(log: CallLog) -> Self {
        Self {
            state: Arc::default(),
            log,
        }
    }

    pub fn call_log(&self) -> &CallLog {
        &self.log
    }

    pub fn fail_next(&self, operation: Operation, failure: ScriptedFailure, times: usize) {
        lock(&self.state)
            .scripts
            .set(operation, failure, Some(times));
    }

    pub fn fail_always(&self, operation: Operation, failure: ScriptedFailure) {
        lock(&self.state).scripts.set(operation, failure, None);
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = Some(latency);
    }

    /// Status reported for new placements.
    pub fn set_placement_status(&self, status: OrderStatus) {
        lock(&self.state).placement_status = status;
    }

    pub fn order(&self, order_id: &str) -> Option<BookedOrder> {
        lock(&self.state).orders.get(order_id).cloned()
    }

    pub fn order_count(&self) -> usize {
        lock(&self.state).orders.len()
    }

    /// Orders not cancelled.
    pub fn live_order_count(&self) -> usize {
        lock(&self.state)
            .orders
            .values()
            .filter(|o| o.status != OrderStatus::Cancelled)
            .count()
    }

    async fn begin(&self, operation: Operation, key: &str, resource_id: Option<&str>) -> Option<ScriptedFailure> {
        self.log.push(operation, key, resource_id);
        let (latency, scripted) = {
            let mut state = lock(&self.state);
            (state.latency, state.scripts.take(operation))
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if scripted == Some(ScriptedFailure::Hang) {
            std::future::pending::<()>().await;
        }
        scripted
    }
}

#[async_trait]
impl MatchingService for InMemoryMatchingService {
    async fn place_order(&self, request: &PlaceOrder) -> StepOutcome<Placement> {
        let key = request.idempotency_key.as_str();
        let scripted = self.begin(Operation::PlaceOrder, key, None).await;
        if let Some(outcome) = rejection(&scripted) {
            return outcome;
        }

        let placement = {
            let mut state = lock(&self.state);
            match state.order_by_key.get(key).cloned() {
                Some(order_id) => {
                    let order = &state.orders[&order_id];
                    Placement {
                        order_id,
                        match_id: order.match_id.clone(),
                        status: order.status,
                    }
                }
                None => {
                    state.next_id += 1;
                    let order_id = format!("ord-{:04}", state.next_id);
                    let status = state.placement_status;
                    let match_id = matches!(
                        status,
                        OrderStatus::Matched | OrderStatus::PartiallyFilled
                    )
                    .then(|| format!("match-{:04}", state.next_id));
                    state.orders.insert(
                        order_id.clone(),
                        BookedOrder {
                            reservation_id: request.reservation_id.clone(),
                            status,
                            match_id: match_id.clone(),
                        },
                    );
                    state.order_by_key.insert(key.to_string(), order_id.clone());
                    Placement {
                        order_id,
                        match_id,
                        status,
                    }
                }
            }
        };

        answer(scripted, placement)
    }

    async fn cancel_order(&self, request: &ResourceCall) -> StepOutcome<Acknowledgement> {
        let scripted = self
            .begin(
                Operation::CancelOrder,
                request.idempotency_key.as_str(),
                Some(&request.resource_id),
            )
            .await;
        if let Some(outcome) = rejection(&scripted) {
            return outcome;
        }

        let status = {
            let mut state = lock(&self.state);
            match state.orders.get_mut(&request.resource_id) {
                Some(order) => {
                    order.status = OrderStatus::Cancelled;
                    "CANCELLED"
                }
                None => "NOT_FOUND",
            }
        };

        answer(scripted, Acknowledgement {
            status: status.to_string(),
        })
    }
}
