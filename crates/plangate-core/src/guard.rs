//! Pre-step guard evaluation.
//!
//! `GuardEvaluator` holds no mutable state; the only thing it reads besides
//! its arguments is the injected clock, so it can be shared freely and called
//! concurrently.

use plangate_types::plan::Guard;

use crate::clock::{elapsed_ms, SharedClock};
use crate::context::StepContext;

/// Outcome of evaluating a step's guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardResult {
    pub ok: bool,
    /// Identity of the first failing guard, when `ok` is false.
    pub reason: Option<String>,
}

impl GuardResult {
    pub fn pass() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn fail(reason: String) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

/// Evaluates guard predicates against a step context.
#[derive(Debug, Clone)]
pub struct GuardEvaluator {
    clock: SharedClock,
}

impl GuardEvaluator {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Evaluate guards in declared order, stopping at the first failure.
    pub fn evaluate_step(&self, guards: &[Guard], context: &StepContext) -> GuardResult {
        for (index, guard) in guards.iter().enumerate() {
            if let Err(detail) = self.evaluate(guard, context) {
                return GuardResult::fail(format!("guard[{index}] {}: {detail}", guard.kind()));
            }
        }
        GuardResult::pass()
    }

    fn evaluate(&self, guard: &Guard, context: &StepContext) -> Result<(), String> {
        match guard {
            Guard::TimeoutMs { timeout_ms } => {
                let elapsed = elapsed_ms(context.started_at, self.clock.now());
                if elapsed > *timeout_ms {
                    Err(format!("{elapsed}ms elapsed exceeds {timeout_ms}ms"))
                } else {
                    Ok(())
                }
            }
            Guard::RequiresOutput { step_id } => {
                if context.outputs.contains_key(step_id) {
                    Ok(())
                } else {
                    Err(format!("no output recorded for step '{step_id}'"))
                }
            }
        }
    }
}
