//! Settings the saga engine is constructed with.

use std::time::Duration;

use domain::ValidationLimits;

use crate::gateway::{CallPolicy, RetryPolicy};

/// Plain configuration values; loading and checking them is the caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    pub limits: ValidationLimits,
    /// Upper bound on one downstream attempt.
    pub call_timeout: Duration,
    pub forward_retry: RetryPolicy,
    pub compensation_retry: RetryPolicy,
    pub max_concurrent_sagas: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            limits: ValidationLimits::default(),
            call_timeout: Duration::from_secs(10),
            forward_retry: RetryPolicy::forward(),
            compensation_retry: RetryPolicy::compensation(),
            max_concurrent_sagas: 10,
        }
    }
}

impl SagaConfig {
    pub fn forward_policy(&self) -> CallPolicy {
        CallPolicy::new(self.call_timeout, self.forward_retry.clone())
    }

    pub fn compensation_policy(&self) -> CallPolicy {
        CallPolicy::new(self.call_timeout, self.compensation_retry.clone())
    }
}
