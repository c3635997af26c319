//! Saga error types.
//!
//! Downstream failures are not errors here: they end up on the saga record
//! as a state, a reason and a [`FailureKind`](crate::FailureKind). A
//! `SagaError` means the saga could not be driven at all.

use common::SagaId;
use domain::DomainError;
use event_store::EventStoreError;
use thiserror::Error;

use crate::state::SagaState;

#[derive(Debug, Error)]
pub enum SagaError {
    /// The state machine does not allow this move.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaState, to: SagaState },

    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A saga with this ID was already started.
    #[error("Saga already exists: {0}")]
    AlreadyExists(SagaId),

    /// The runner is shutting down and takes no new sagas.
    #[error("Saga runner is shutting down")]
    ShuttingDown,

    /// The log has no SagaStarted event for this saga.
    #[error("Saga {0} has no recorded request")]
    MissingRequest(SagaId),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// True when another coordinator wrote to the same saga first.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SagaError::EventStore(EventStoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
