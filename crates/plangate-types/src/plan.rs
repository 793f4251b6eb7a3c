//! Plan definition types.
//!
//! A `Plan` is the immutable, author-supplied definition of an ordered
//! sequence of steps. Once a job has been started from a plan the plan is
//! never mutated; the job only tracks how far through it execution got.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::lock::LockMode;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// The immutable definition of a multi-step automation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Author-assigned plan identifier.
    pub plan_id: String,
    /// Whole-plan budgets enforced by the watchdog.
    #[serde(default)]
    pub budgets: PlanBudget,
    /// Ordered steps. Step IDs are unique within a plan.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Create a plan with default (unbounded) budgets.
    pub fn new(plan_id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            plan_id: plan_id.into(),
            budgets: PlanBudget::default(),
            steps,
        }
    }

    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Whole-plan limits. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBudget {
    /// Maximum wall-clock duration of a single run, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,
    /// Maximum number of steps a single run may execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// Maximum number of retries across all steps of a single run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier, unique within the plan.
    pub step_id: String,
    /// Action kind (e.g. `touch`, `sleep`, `record`), resolved against the
    /// runner's action registry.
    #[serde(rename = "type")]
    pub step_type: String,
    /// Opaque keyed parameters handed to the action.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    /// Per-step timeout / retry count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<StepBudget>,
    /// Pre-step guards, evaluated in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guards: Vec<Guard>,
    /// Retry policy for guard, lock, and action failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Resources this step must hold while it runs. When empty, the runner
    /// takes an exclusive lock named after the step type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locks: Vec<LockRequest>,
}

impl Step {
    /// Create a step with no guards, budget, retry policy or lock declarations.
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            step_type: step_type.into(),
            payload: HashMap::new(),
            budget: None,
            guards: Vec::new(),
            retry: None,
            locks: Vec::new(),
        }
    }

    /// Builder: set a payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Builder: append a guard.
    pub fn with_guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    /// Builder: set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Builder: set the step budget.
    pub fn with_budget(mut self, budget: StepBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Builder: declare a resource lock.
    pub fn with_lock(mut self, resource: impl Into<String>, mode: LockMode) -> Self {
        self.locks.push(LockRequest {
            resource: resource.into(),
            mode,
        });
        self
    }

    /// The locks the runner acquires for this step.
    pub fn effective_locks(&self) -> Vec<LockRequest> {
        if self.locks.is_empty() {
            vec![LockRequest {
                resource: self.step_type.clone(),
                mode: LockMode::Exclusive,
            }]
        } else {
            self.locks.clone()
        }
    }
}

/// Per-step limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBudget {
    /// Upper bound on a single action attempt, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retries allowed when no explicit `RetryPolicy` is declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// A named resource a step must hold, and in which mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequest {
    pub resource: String,
    #[serde(default)]
    pub mode: LockMode,
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// A pre-step predicate.
///
/// Serialized as `{type, params}`:
/// ```yaml
/// guards:
///   - type: timeout_ms
///     params:
///       timeout_ms: 100
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum Guard {
    /// Fails once more than `timeout_ms` has elapsed since the step started.
    TimeoutMs { timeout_ms: u64 },
    /// Fails unless an earlier step of this run recorded output.
    RequiresOutput { step_id: String },
}

impl Guard {
    /// Stable name of the guard kind, used as the failure reason prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            Guard::TimeoutMs { .. } => "timeout_ms",
            Guard::RequiresOutput { .. } => "requires_output",
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }

    /// A policy with `max_attempts` and the given fixed delay.
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Backoff {
                initial_ms: delay_ms,
                multiplier: 1.0,
                max_ms: delay_ms,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_initial_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    5_000
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            multiplier: default_multiplier(),
            max_ms: default_max_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn guard_serializes_as_type_and_params() {
        let guard = Guard::TimeoutMs { timeout_ms: 100 };
        let value = serde_json::to_value(&guard).unwrap();
        assert_eq!(value, json!({"type": "timeout_ms", "params": {"timeout_ms": 100}}));

        let parsed: Guard = serde_json::from_value(json!({
            "type": "requires_output",
            "params": {"step_id": "s1"}
        }))
        .unwrap();
        assert_eq!(parsed, Guard::RequiresOutput { step_id: "s1".to_string() });
    }

    #[test]
    fn unknown_guard_type_is_rejected() {
        let result: Result<Guard, _> =
            serde_json::from_value(json!({"type": "battery_level", "params": {}}));
        assert!(result.is_err());
    }

    #[test]
    fn step_defaults_from_minimal_json() {
        let step: Step = serde_json::from_value(json!({"step_id": "s1", "type": "touch"})).unwrap();
        assert_eq!(step.step_type, "touch");
        assert!(step.payload.is_empty());
        assert!(step.guards.is_empty());
        assert!(step.retry.is_none());
    }

    #[test]
    fn effective_locks_default_to_step_type() {
        let step = Step::new("s1", "touch");
        assert_eq!(
            step.effective_locks(),
            vec![LockRequest {
                resource: "touch".to_string(),
                mode: LockMode::Exclusive
            }]
        );

        let step = Step::new("s2", "screenshot").with_lock("screen", LockMode::Read);
        assert_eq!(step.effective_locks()[0].resource, "screen");
        assert_eq!(step.effective_locks()[0].mode, LockMode::Read);
    }

    #[test]
    fn retry_policy_default_max_attempts_is_three() {
        let policy: RetryPolicy = serde_json::from_value(json!({})).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff.initial_ms, 100);
    }
}
