//! Timeout and retry policy applied to every downstream call.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};

use super::{Operation, StepFailure, StepOutcome};

/// Exponential backoff bounds for one class of calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
    /// Total attempts including the first (1 = never retry).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forward()
    }
}

impl RetryPolicy {
    /// Policy for forward steps: 1s, 2s, ... capped at 60s, three attempts.
    pub fn forward() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    /// Policy for compensating calls: a single retry, then report.
    pub fn compensation() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 1.0,
            max_interval: Duration::from_secs(1),
            max_attempts: 2,
        }
    }

    /// Backoff schedule between attempts, without jitter so the delays
    /// are reproducible from the log timestamps.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_interval)
            .with_max_delay(self.max_interval)
            .with_factor(self.backoff_coefficient as f32)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }

    /// Sum of every delay the schedule can produce.
    pub fn total_delay(&self) -> Duration {
        self.backoff().build().sum()
    }
}

/// Per-call timeout plus the retry policy for the call class.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// One failed attempt, split by whether another attempt may follow.
#[derive(Debug)]
enum Attempt {
    Retryable(StepFailure),
    Fatal(StepFailure),
}

impl Attempt {
    fn is_retryable(&self) -> bool {
        matches!(self, Attempt::Retryable(_))
    }

    fn failure(&self) -> &StepFailure {
        match self {
            Attempt::Retryable(failure) | Attempt::Fatal(failure) => failure,
        }
    }
}

impl CallPolicy {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    /// Longest a call under this policy can run, every attempt timing out.
    pub fn worst_case(&self) -> Duration {
        self.timeout.saturating_mul(self.retry.max_attempts.max(1)) + self.retry.total_delay()
    }

    /// Runs `call` until it succeeds, fails fatally or runs out of attempts.
    ///
    /// A call that exceeds the timeout counts as a retryable failure whose
    /// effect is unknown. Running out of attempts turns the last retryable
    /// failure into a fatal one with `retries_exhausted` set.
    pub async fn run<T, F, Fut>(&self, operation: Operation, mut call: F) -> StepOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StepOutcome<T>>,
    {
        let attempts = AtomicU32::new(0);
        let effect_unknown = AtomicBool::new(false);
        let timeout = self.timeout;

        let result = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("gateway_call_attempts_total", "operation" => operation.as_str())
                .increment(1);
            let attempt = call();
            async move {
                match tokio::time::timeout(timeout, attempt).await {
                    Ok(StepOutcome::Success(value)) => Ok(value),
                    Ok(StepOutcome::FatalFailure(failure)) => Err(Attempt::Fatal(failure)),
                    Ok(StepOutcome::RetryableFailure(failure)) => {
                        Err(Attempt::Retryable(failure))
                    }
                    Err(_) => Err(Attempt::Retryable(StepFailure::ambiguous(format!(
                        "{operation} timed out after {}ms",
                        timeout.as_millis()
                    )))),
                }
            }
        })
        .retry(self.retry.backoff())
        .when(Attempt::is_retryable)
        .notify(|attempt: &Attempt, delay: Duration| {
            let failure = attempt.failure();
            effect_unknown.fetch_or(failure.effect_unknown, Ordering::Relaxed);
            tracing::warn!(
                %operation,
                attempt = attempts.load(Ordering::Relaxed),
                delay_ms = delay.as_millis() as u64,
                error = %failure.message,
                "retrying downstream call"
            );
            metrics::counter!("gateway_call_retries_total", "operation" => operation.as_str())
                .increment(1);
        })
        .await;

        match result {
            Ok(value) => StepOutcome::Success(value),
            Err(Attempt::Fatal(failure)) => StepOutcome::FatalFailure(failure),
            Err(Attempt::Retryable(failure)) => {
                let attempts = attempts.load(Ordering::Relaxed);
                tracing::warn!(
                    %operation,
                    attempts,
                    error = %failure.message,
                    "retries exhausted"
                );
                StepOutcome::FatalFailure(StepFailure {
                    message: format!("{} (after {attempts} attempts)", failure.message),
                    effect_unknown: failure.effect_unknown
                        || effect_unknown.load(Ordering::Relaxed),
                    retries_exhausted: true,
                })
            }
        }
    }
}
