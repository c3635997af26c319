//! Idempotency keys for downstream calls.
//!
//! Every forward and compensating call carries a key derived only from the
//! saga ID and the step, so a retried or resumed step reuses the key and the
//! downstream service can collapse duplicates. The services are required to
//! deduplicate effects by this key.

use serde::{Deserialize, Serialize};

use common::SagaId;

/// A downstream call made by a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Reserve,
    Order,
    Commit,
    CancelOrder,
    CancelReservation,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Reserve => "reserve",
            Step::Order => "order",
            Step::Commit => "commit",
            Step::CancelOrder => "cancel-order",
            Step::CancelReservation => "cancel-reservation",
        }
    }

    /// True for the cancellations run during rollback.
    pub fn is_compensating(&self) -> bool {
        matches!(self, Step::CancelOrder | Step::CancelReservation)
    }

    /// Prefix used when this step's failure becomes the saga's reason.
    pub fn failure_context(&self) -> &'static str {
        match self {
            Step::Reserve => "fund reservation failed",
            Step::Order => "order placement failed",
            Step::Commit => "reservation commit failed",
            Step::CancelOrder => "order cancellation failed",
            Step::CancelReservation => "reservation cancellation failed",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token sent with a downstream call, formatted `{saga_id}-{step}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(saga_id: SagaId, step: Step) -> Self {
        Self(format!("{saga_id}-{}", step.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Shorthand for [`IdempotencyKey::derive`].
pub fn derive_key(saga_id: SagaId, step: Step) -> IdempotencyKey {
    IdempotencyKey::derive(saga_id, step)
}
