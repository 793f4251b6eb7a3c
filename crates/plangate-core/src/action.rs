//! Step actions and the registry that resolves them by step type.
//!
//! A step's `type` names the capability that executes it. Capabilities are
//! registered up front; the runner refuses to start a job whose remaining
//! steps name an unregistered type.
//!
//! `StepAction` uses native async fn in traits, so it is not object safe.
//! The same blanket-impl pattern as the LLM provider wrapper applies:
//! 1. `StepActionDyn` is the object-safe twin with boxed futures
//! 2. every `T: StepAction` implements it via a blanket impl
//! 3. `BoxStepAction` wraps `Arc<dyn StepActionDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use plangate_types::error::ActionError;
use plangate_types::plan::Step;

use crate::context::StepContext;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Executes one step of a given type.
///
/// Return `ActionError::Failed` for conditions worth retrying and
/// `ActionError::Fatal` for failures no retry can fix. The returned value is
/// recorded as the step's output.
pub trait StepAction: Send + Sync {
    fn execute(
        &self,
        step: &Step,
        context: &StepContext,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send;
}

/// Object-safe version of [`StepAction`] with boxed futures.
pub trait StepActionDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        context: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>>;
}

impl<T: StepAction> StepActionDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        step: &'a Step,
        context: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>> {
        Box::pin(self.execute(step, context))
    }
}

/// Type-erased, cheaply cloneable step action.
#[derive(Clone)]
pub struct BoxStepAction {
    inner: Arc<dyn StepActionDyn>,
}

impl BoxStepAction {
    pub fn new<T: StepAction + 'static>(action: T) -> Self {
        Self {
            inner: Arc::new(action),
        }
    }

    pub async fn execute(&self, step: &Step, context: &StepContext) -> Result<Value, ActionError> {
        self.inner.execute_boxed(step, context).await
    }
}

impl std::fmt::Debug for BoxStepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepAction").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps step types to their actions.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, BoxStepAction>,
}

impl ActionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `sleep` and `record` actions.
    ///
    /// `record` appends to `recorder`.
    pub fn with_builtins(recorder: Recorder) -> Self {
        let mut registry = Self::new();
        registry.register("sleep", SleepAction);
        registry.register("record", RecordAction::new(recorder));
        registry
    }

    /// Register `action` for `step_type`, replacing any previous one.
    pub fn register<T: StepAction + 'static>(&mut self, step_type: impl Into<String>, action: T) {
        self.actions.insert(step_type.into(), BoxStepAction::new(action));
    }

    pub fn get(&self, step_type: &str) -> Option<&BoxStepAction> {
        self.actions.get(step_type)
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.actions.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.actions.keys().cloned().collect();
        types.sort();
        types
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

/// `sleep`: waits `payload.ms` milliseconds (default 0).
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepAction;

impl StepAction for SleepAction {
    async fn execute(&self, step: &Step, _context: &StepContext) -> Result<Value, ActionError> {
        let ms = match step.payload.get("ms") {
            None => 0,
            Some(value) => value.as_u64().ok_or_else(|| {
                ActionError::Fatal(format!("sleep payload 'ms' must be a non-negative integer, got {value}"))
            })?,
        };
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Shared list of values appended by [`RecordAction`].
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    values: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, value: String) {
        self.values.lock().expect("recorder lock poisoned").push(value);
    }

    /// Everything recorded so far, in order.
    pub fn recorded(&self) -> Vec<String> {
        self.values.lock().expect("recorder lock poisoned").clone()
    }
}

/// `record`: appends `payload.value` (or the step ID when absent) to a
/// [`Recorder`].
#[derive(Debug, Clone)]
pub struct RecordAction {
    recorder: Recorder,
}

impl RecordAction {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl StepAction for RecordAction {
    async fn execute(&self, step: &Step, _context: &StepContext) -> Result<Value, ActionError> {
        let value = match step.payload.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => step.step_id.clone(),
        };
        self.recorder.push(value.clone());
        Ok(json!({ "value": value }))
    }
}

/// Succeeds immediately without side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

impl StepAction for NoopAction {
    async fn execute(&self, _step: &Step, _context: &StepContext) -> Result<Value, ActionError> {
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn record_appends_payload_value() {
        let recorder = Recorder::new();
        let registry = ActionRegistry::with_builtins(recorder.clone());
        let action = registry.get("record").unwrap();

        let step = Step::new("s1", "record").with_payload("value", json!("hello"));
        let output = action.execute(&step, &StepContext::new(Utc::now())).await.unwrap();

        assert_eq!(output, json!({"value": "hello"}));
        assert_eq!(recorder.recorded(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn record_defaults_to_step_id() {
        let recorder = Recorder::new();
        let action = RecordAction::new(recorder.clone());
        action
            .execute(&Step::new("s9", "record"), &StepContext::new(Utc::now()))
            .await
            .unwrap();
        assert_eq!(recorder.recorded(), vec!["s9".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_waits_payload_ms() {
        let step = Step::new("s1", "sleep").with_payload("ms", json!(10));
        let start = tokio::time::Instant::now();
        let output = SleepAction
            .execute(&step, &StepContext::new(Utc::now()))
            .await
            .unwrap();
        assert_eq!(output["slept_ms"], 10);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn sleep_rejects_bad_payload() {
        let step = Step::new("s1", "sleep").with_payload("ms", json!("soon"));
        let err = SleepAction
            .execute(&step, &StepContext::new(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Fatal(_)));
    }

    #[test]
    fn registry_lists_types() {
        let mut registry = ActionRegistry::with_builtins(Recorder::new());
        registry.register("touch", NoopAction);
        assert!(registry.contains("touch"));
        assert!(!registry.contains("swipe"));
        assert_eq!(registry.step_types(), vec!["record", "sleep", "touch"]);
    }
}
