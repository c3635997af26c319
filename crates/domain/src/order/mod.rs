//! Order placement requests and the rules that gate them.

mod request;
mod validation;
mod value_objects;

pub use request::OrderRequest;
pub use validation::{OrderValidator, ValidationLimits, ValidationOutcome, ValidationReason};
pub use value_objects::Side;
