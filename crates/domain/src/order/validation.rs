//! Field and threshold checks that gate saga entry.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DomainError, OrderRequest, Side};

/// Inclusive stake and odds bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    min_stake: Decimal,
    max_stake: Decimal,
    min_odds: Decimal,
    max_odds: Decimal,
}

impl ValidationLimits {
    /// Builds limits, rejecting ranges that would make every order invalid
    /// or admit no-loss odds.
    pub fn new(
        min_stake: Decimal,
        max_stake: Decimal,
        min_odds: Decimal,
        max_odds: Decimal,
    ) -> Result<Self, DomainError> {
        if min_stake <= Decimal::ZERO || min_stake > max_stake {
            return Err(DomainError::InvalidStakeLimits {
                min: min_stake,
                max: max_stake,
            });
        }
        if min_odds <= Decimal::ONE || min_odds > max_odds {
            return Err(DomainError::InvalidOddsLimits {
                min: min_odds,
                max: max_odds,
            });
        }
        Ok(Self {
            min_stake,
            max_stake,
            min_odds,
            max_odds,
        })
    }

    pub fn min_stake(&self) -> Decimal {
        self.min_stake
    }

    pub fn max_stake(&self) -> Decimal {
        self.max_stake
    }

    pub fn min_odds(&self) -> Decimal {
        self.min_odds
    }

    pub fn max_odds(&self) -> Decimal {
        self.max_odds
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            min_stake: dec!(1),
            max_stake: dec!(10000),
            min_odds: dec!(1.01),
            max_odds: dec!(1000),
        }
    }
}

/// Why a request was rejected. The `Display` text is stable and shown to
/// callers as the saga's failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationReason {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid side: must be BACK or LAY")]
    InvalidSide,

    #[error("invalid currency: must be 3-letter code")]
    InvalidCurrency,

    #[error("invalid odds: must be greater than 1.0")]
    InvalidOdds,

    #[error("invalid stake: must be positive")]
    InvalidStake,

    #[error("stake too low: minimum is {min}")]
    StakeTooLow { min: Decimal },

    #[error("stake too high: maximum is {max}")]
    StakeTooHigh { max: Decimal },

    #[error("odds too low: minimum is {min}")]
    OddsTooLow { min: Decimal },

    #[error("odds too high: maximum is {max}")]
    OddsTooHigh { max: Decimal },
}

impl ValidationReason {
    /// Short, bounded label for metrics.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationReason::MissingField(_) => "missing_field",
            ValidationReason::InvalidSide => "invalid_side",
            ValidationReason::InvalidCurrency => "invalid_currency",
            ValidationReason::InvalidOdds => "invalid_odds",
            ValidationReason::InvalidStake => "invalid_stake",
            ValidationReason::StakeTooLow { .. } => "stake_too_low",
            ValidationReason::StakeTooHigh { .. } => "stake_too_high",
            ValidationReason::OddsTooLow { .. } => "odds_too_low",
            ValidationReason::OddsTooHigh { .. } => "odds_too_high",
        }
    }
}

/// Result of validating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationOutcome {
    pub fn accepted() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn rejected(reason: &ValidationReason) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Stateless request validator.
///
/// Checks run in a fixed order and stop at the first failure, so the same
/// request always yields the same reason.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderValidator {
    limits: ValidationLimits,
}

impl OrderValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    pub fn validate(&self, request: &OrderRequest) -> ValidationOutcome {
        match self.check(request) {
            Ok(()) => ValidationOutcome::accepted(),
            Err(reason) => ValidationOutcome::rejected(&reason),
        }
    }

    /// Like [`validate`](Self::validate) but keeps the typed reason.
    pub fn check(&self, request: &OrderRequest) -> Result<(), ValidationReason> {
        Self::check_fields(request)?;

        if request.odds <= Decimal::ONE {
            return Err(ValidationReason::InvalidOdds);
        }
        if request.stake <= Decimal::ZERO {
            return Err(ValidationReason::InvalidStake);
        }

        let limits = &self.limits;
        if request.stake < limits.min_stake {
            return Err(ValidationReason::StakeTooLow {
                min: limits.min_stake,
            });
        }
        if request.stake > limits.max_stake {
            return Err(ValidationReason::StakeTooHigh {
                max: limits.max_stake,
            });
        }
        if request.odds < limits.min_odds {
            return Err(ValidationReason::OddsTooLow {
                min: limits.min_odds,
            });
        }
        if request.odds > limits.max_odds {
            return Err(ValidationReason::OddsTooHigh {
                max: limits.max_odds,
            });
        }

        Ok(())
    }

    fn check_fields(request: &OrderRequest) -> Result<(), ValidationReason> {
        let required = [
            ("user_id", &request.user_id),
            ("event_id", &request.event_id),
            ("market_id", &request.market_id),
            ("selection_id", &request.selection_id),
            ("idempotency_key", &request.idempotency_key),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationReason::MissingField(name));
            }
        }

        if request.side.parse::<Side>().is_err() {
            return Err(ValidationReason::InvalidSide);
        }

        let currency = &request.currency;
        if currency.len() != 3 || !currency.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(ValidationReason::InvalidCurrency);
        }

        Ok(())
    }
}
