//! Plan parsing, validation, and loading from disk.
//!
//! Plans are authored as YAML (or JSON) and deserialize straight into the
//! `Plan` type. Parsing always validates, so a `Plan` obtained from this
//! module is structurally sound.

use std::collections::HashSet;
use std::path::Path;

use plangate_types::error::EngineError;
use plangate_types::plan::{Guard, Plan, RetryPolicy};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a YAML plan.
pub fn parse_plan_yaml(yaml: &str) -> Result<Plan, EngineError> {
    let plan: Plan = serde_yaml_ng::from_str(yaml)
        .map_err(|e| EngineError::Validation(format!("plan parse error: {e}")))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Parse and validate a JSON plan.
pub fn parse_plan_json(json: &str) -> Result<Plan, EngineError> {
    let plan: Plan = serde_json::from_str(json)
        .map_err(|e| EngineError::Validation(format!("plan parse error: {e}")))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Serialize a plan to YAML.
pub fn serialize_plan_yaml(plan: &Plan) -> Result<String, EngineError> {
    serde_yaml_ng::to_string(plan)
        .map_err(|e| EngineError::Validation(format!("plan serialize error: {e}")))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a plan.
///
/// Checks:
/// - plan ID is non-empty and at least one step exists
/// - step IDs are non-empty and unique, step types are non-empty
/// - declared lock resources are non-empty and named at most once per step
/// - `requires_output` guards name an earlier step
/// - retry policies allow at least one attempt and never shrink the backoff
pub fn validate_plan(plan: &Plan) -> Result<(), EngineError> {
    if plan.plan_id.trim().is_empty() {
        return Err(EngineError::Validation(
            "plan_id must not be empty".to_string(),
        ));
    }
    if plan.steps.is_empty() {
        return Err(EngineError::Validation(format!(
            "plan '{}' must have at least one step",
            plan.plan_id
        )));
    }

    let mut seen = HashSet::new();
    for step in &plan.steps {
        if step.step_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "step_id must not be empty".to_string(),
            ));
        }
        if step.step_type.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "step '{}' has an empty type",
                step.step_id
            )));
        }
        let mut resources = HashSet::new();
        for lock in &step.locks {
            if lock.resource.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "step '{}' declares a lock with an empty resource name",
                    step.step_id
                )));
            }
            if !resources.insert(lock.resource.as_str()) {
                return Err(EngineError::Validation(format!(
                    "step '{}' declares resource '{}' more than once",
                    step.step_id, lock.resource
                )));
            }
        }
        for guard in &step.guards {
            if let Guard::RequiresOutput { step_id } = guard {
                if !seen.contains(step_id.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' requires output of '{step_id}', which is not an earlier step",
                        step.step_id
                    )));
                }
            }
        }
        if let Some(retry) = &step.retry {
            validate_retry(&step.step_id, retry)?;
        }
        if !seen.insert(step.step_id.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate step ID: '{}'",
                step.step_id
            )));
        }
    }

    Ok(())
}

fn validate_retry(step_id: &str, retry: &RetryPolicy) -> Result<(), EngineError> {
    if retry.max_attempts == 0 {
        return Err(EngineError::Validation(format!(
            "step '{step_id}' retry max_attempts must be >= 1"
        )));
    }
    if retry.backoff.multiplier.is_nan() || retry.backoff.multiplier < 1.0 {
        return Err(EngineError::Validation(format!(
            "step '{step_id}' backoff multiplier must be >= 1.0"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Load a plan from a `.yaml`/`.yml` or `.json` file.
pub fn load_plan(path: &Path) -> Result<Plan, EngineError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Storage(format!("failed to read {}: {e}", path.display())))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_plan_json(&content),
        _ => parse_plan_yaml(&content),
    }
}
