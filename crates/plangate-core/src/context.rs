//! Execution context handed to guards and step actions.
//!
//! `RunContext` accumulates step outputs across one `run` call;
//! `StepContext` is the per-step view built from it, carrying the instant
//! the step started and the outputs of every earlier step.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use plangate_types::plan::Step;

/// Maximum size of a single recorded step output (1 MB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

/// Step outputs accumulated during one run of a job.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    outputs: HashMap<String, Value>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the output of a completed step.
    ///
    /// Outputs larger than `MAX_STEP_OUTPUT_SIZE` once serialized are replaced
    /// by a truncation marker.
    pub fn record_output(&mut self, step_id: &str, output: Value) {
        let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        if size > MAX_STEP_OUTPUT_SIZE {
            tracing::warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            self.outputs.insert(
                step_id.to_string(),
                json!({ "_truncated": true, "_original_size": size }),
            );
        } else {
            self.outputs.insert(step_id.to_string(), output);
        }
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }

    /// Build the context for one step.
    pub fn for_step(
        &self,
        job_id: &str,
        index: usize,
        step: &Step,
        started_at: DateTime<Utc>,
    ) -> StepContext {
        StepContext {
            job_id: job_id.to_string(),
            step_id: step.step_id.clone(),
            step_index: index,
            attempt: 1,
            started_at,
            outputs: self.outputs.clone(),
        }
    }
}

/// What a guard or action sees about the step being executed.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: String,
    pub step_id: String,
    pub step_index: usize,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the first attempt of this step began.
    pub started_at: DateTime<Utc>,
    /// Outputs of earlier steps, keyed by step ID.
    pub outputs: HashMap<String, Value>,
}

impl StepContext {
    /// A bare context, mostly useful for evaluating guards in isolation.
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            job_id: String::new(),
            step_id: String::new(),
            step_index: 0,
            attempt: 1,
            started_at,
            outputs: HashMap::new(),
        }
    }
}
