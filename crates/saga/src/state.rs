//! Saga state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of one order placement saga.
///
/// ```text
/// Pending ──► Validating ──┬──► Reserving ──┬──► Matching ──┬──► Settled
///                          │                │               ├──► Failed
///                          └──► Failed      ├──► Failed     └──► Cancelled
///                                           └──► Cancelled
/// ```
///
/// `Settled`, `Failed` and `Cancelled` are terminal. Nothing returns to
/// `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum SagaState {
    /// Accepted and logged, not yet picked up by a worker.
    #[default]
    Pending,

    /// Request is being checked against field rules and limits.
    Validating,

    /// Funds are being reserved.
    Reserving,

    /// Order is being placed with the matching service.
    Matching,

    /// Reservation committed (terminal).
    Settled,

    /// A step failed (terminal).
    Failed,

    /// Cancelled on request (terminal).
    Cancelled,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Settled | SagaState::Failed | SagaState::Cancelled
        )
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Pending, Validating)
                | (Validating, Reserving)
                | (Validating, Failed)
                | (Reserving, Matching)
                | (Reserving, Failed)
                | (Reserving, Cancelled)
                | (Matching, Settled)
                | (Matching, Failed)
                | (Matching, Cancelled)
        )
    }

    /// Returns the state name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Pending => "PENDING",
            SagaState::Validating => "VALIDATING",
            SagaState::Reserving => "RESERVING",
            SagaState::Matching => "MATCHING",
            SagaState::Settled => "SETTLED",
            SagaState::Failed => "FAILED",
            SagaState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a terminal failure, as surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The request failed field or threshold checks.
    Validation,
    /// A downstream service stayed unreachable through every retry.
    RetryableTransport,
    /// A downstream service rejected the call outright.
    FatalDownstream,
    /// Stopped on request.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "VALIDATION",
            FailureKind::RetryableTransport => "RETRYABLE_TRANSPORT",
            FailureKind::FatalDownstream => "FATAL_DOWNSTREAM",
            FailureKind::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
