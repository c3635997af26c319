//! Domain error types.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by domain types outside of request validation.
///
/// A request that fails validation is not an error; it yields a
/// [`ValidationOutcome`](crate::ValidationOutcome) with a reason.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    /// The side string is neither BACK nor LAY.
    #[error("invalid side: {0}")]
    InvalidSide(String),

    /// Stake bounds are not a usable range.
    #[error("invalid stake limits: min {min}, max {max}")]
    InvalidStakeLimits { min: Decimal, max: Decimal },

    /// Odds bounds are not a usable range.
    #[error("invalid odds limits: min {min}, max {max}")]
    InvalidOddsLimits { min: Decimal, max: Decimal },
}
