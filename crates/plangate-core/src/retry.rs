//! Bounded retry with exponential backoff.
//!
//! The runner drives retries as an explicit loop; this module only answers
//! "may I try again?" and "how long do I wait first?".

use std::time::Duration;

use plangate_types::error::EngineError;
use plangate_types::plan::{RetryPolicy, Step};

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry decisions for step attempts.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` (1-based) failed
    /// with `error`.
    ///
    /// Only retryable errors (guard, lock and action failures) are retried.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &EngineError) -> bool {
        error.is_retryable() && attempt < policy.max_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    ///
    /// `initial_ms * multiplier^(attempt - 1)`, capped at `max_ms`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let backoff = &policy.backoff;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = backoff.initial_ms as f64 * backoff.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(backoff.max_ms as f64)
        } else {
            backoff.max_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// The policy governing `step`.
    ///
    /// An explicit `retry` wins; otherwise `budget.max_retries` allows that
    /// many retries on top of the first attempt; otherwise `default`.
    pub fn effective_policy(step: &Step, default: &RetryPolicy) -> RetryPolicy {
        if let Some(policy) = &step.retry {
            return policy.clone();
        }
        if let Some(max_retries) = step.budget.as_ref().and_then(|b| b.max_retries) {
            return RetryPolicy {
                max_attempts: max_retries.saturating_add(1),
                backoff: default.backoff.clone(),
            };
        }
        default.clone()
    }
}
