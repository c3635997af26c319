//! Shared types used across the order placement saga crates.

pub mod types;

pub use types::{ParseSagaIdError, SagaId};
