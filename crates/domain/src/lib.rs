//! Domain layer for order placement.
//!
//! This crate provides:
//! - `OrderRequest`, `Side` and the stake/liability arithmetic
//! - `OrderValidator`, the stateless gate a request passes before any money moves
//! - `Aggregate` and `DomainEvent` traits used to fold saga logs into records

pub mod aggregate;
pub mod error;
pub mod order;

pub use aggregate::{Aggregate, DomainEvent};
pub use error::DomainError;
pub use order::{
    OrderRequest, OrderValidator, Side, ValidationLimits, ValidationOutcome, ValidationReason,
};
