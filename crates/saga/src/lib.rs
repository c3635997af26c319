//! Order placement saga.
//!
//! Places an order across a funds service and a matching service that
//! share no transaction:
//! 1. Validate the request
//! 2. Reserve the liability
//! 3. Place the order against the reservation
//! 4. Commit the reservation
//!
//! If a step fails after funds were reserved, the order is cancelled and
//! then the reservation, and any cancellation that fails is reported
//! instead of being swallowed. Every saga is event-sourced so it can be
//! resumed after a crash without repeating downstream effects.

pub mod aggregate;
pub mod compensation;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod gateway;
pub mod idempotency;
pub mod runner;
pub mod state;

pub use aggregate::{CompensationStatus, NextAction, SagaRecord};
pub use compensation::{
    CompensationEngine, CompensationEntry, CompensationFailure, CompensationLog,
    CompensationReport, CompensationTargets,
};
pub use config::SagaConfig;
pub use coordinator::{CancelSignal, SagaCoordinator, SagaOutcome};
pub use error::SagaError;
pub use events::SagaEvent;
pub use gateway::{
    ActivityGateway, CallPolicy, FundsService, GatewayError, HttpFundsClient, HttpMatchingClient,
    InMemoryFundsService, InMemoryMatchingService, MatchingService, Operation, OrderStatus,
    RetryPolicy, ScriptedFailure, StepFailure, StepOutcome,
};
pub use idempotency::{IdempotencyKey, Step, derive_key};
pub use runner::SagaRunner;
pub use state::{FailureKind, SagaState};
