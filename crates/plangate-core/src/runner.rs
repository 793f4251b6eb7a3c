//! Plan runner: drives a job's steps from its checkpoint to completion.
//!
//! For each step from the persisted checkpoint the runner:
//!
//! 1. stops if the job was stopped elsewhere or its lease was lost,
//! 2. acquires the step's resource locks (rolled back on partial failure),
//! 3. evaluates the step's guards,
//! 4. consults the watchdog (hang first, then budgets),
//! 5. executes the registered action, bounded by the step timeout,
//! 6. releases the locks, always,
//! 7. on success commits `checkpoint = i + 1` before touching step `i + 1`.
//!
//! Lock and guard failures and retryable action failures go through the
//! step's retry policy. Watchdog violations are never retried: a hang stops
//! the job HUNG and an exhausted budget stops it FAILED. In every failure case
//! the checkpoint stays on the failing step, so the next `run` re-attempts it.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use plangate_types::error::{ActionError, EngineError, WatchdogViolation};
use plangate_types::job::JobState;
use plangate_types::lease::LeaseState;
use plangate_types::plan::{Plan, RetryPolicy, Step};
use plangate_types::telemetry::{EventKind, LogEntry};

use crate::action::{ActionRegistry, Recorder, StepAction};
use crate::clock::{SharedClock, SystemClock};
use crate::context::{RunContext, StepContext};
use crate::guard::GuardEvaluator;
use crate::job::JobManager;
use crate::lease::LeaseManager;
use crate::lock::ResourceLockManager;
use crate::logging::{LogSink, LoggingStore};
use crate::repository::JobStateStore;
use crate::retry::RetryHandler;
use crate::telemetry::TelemetryStore;
use crate::watchdog::{BudgetLimits, Watchdog};

// ---------------------------------------------------------------------------
// Configuration and options
// ---------------------------------------------------------------------------

/// Runner-wide defaults.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Advisory bound passed to every lock acquisition.
    pub lock_timeout_ms: u64,
    /// Retry policy for steps that declare neither `retry` nor
    /// `budget.max_retries`.
    pub default_retry: RetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 1_000,
            default_retry: RetryPolicy::no_retry(),
        }
    }
}

/// Per-call options for [`PlanRunner::run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Extra sink that receives every log entry of this run.
    pub file_logger: Option<Arc<dyn LogSink>>,
    /// Declare the job HUNG after this long without a completed step.
    pub progress_timeout_ms: Option<u64>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_logger(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.file_logger = Some(sink);
        self
    }

    pub fn with_progress_timeout_ms(mut self, ms: u64) -> Self {
        self.progress_timeout_ms = Some(ms);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("file_logger", &self.file_logger.is_some())
            .field("progress_timeout_ms", &self.progress_timeout_ms)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// How a call to [`PlanRunner::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step completed and the job is FINISHED.
    Finished,
    /// A step failed for good; the job is FAILED.
    Failed { step_id: String, reason: String },
    /// No progress within the progress timeout; the job is HUNG.
    Hung { step_id: String, idle_ms: u64 },
    /// A run budget was exhausted; the job is FAILED.
    BudgetExceeded { step_id: String, reason: String },
    /// The controlling lease expired; the job is FAILED.
    LeaseLost { lease_id: String },
    /// Another caller stopped the job; the run halted at a step boundary.
    Stopped { state: JobState },
}

impl RunOutcome {
    /// The job state this outcome leaves behind.
    pub fn job_state(&self) -> JobState {
        match self {
            RunOutcome::Finished => JobState::Finished,
            RunOutcome::Hung { .. } => JobState::Hung,
            RunOutcome::Failed { .. }
            | RunOutcome::BudgetExceeded { .. }
            | RunOutcome::LeaseLost { .. } => JobState::Failed,
            RunOutcome::Stopped { state } => *state,
        }
    }
}

/// Result of one attempt at a step.
enum Attempt {
    Done(Value),
    Violation(WatchdogViolation),
    Fatal(String),
}

/// Result of running one step to completion or give-up.
enum StepResult {
    Completed(Value),
    Halted(RunOutcome),
}

/// Removes a job's cancellation token when a run ends, however it ends.
struct ActiveRun<'a> {
    tokens: &'a DashMap<String, CancellationToken>,
    job_id: &'a str,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.tokens.remove(self.job_id);
    }
}

// ---------------------------------------------------------------------------
// PlanRunner
// ---------------------------------------------------------------------------

/// Executes jobs held by a [`JobManager`].
///
/// Several jobs may run concurrently on one runner; they coordinate only
/// through the shared lock manager and the job manager's durable state.
pub struct PlanRunner<S: JobStateStore> {
    jobs: Arc<JobManager<S>>,
    telemetry: Arc<TelemetryStore>,
    logs: Arc<LoggingStore>,
    watchdog: Arc<Watchdog>,
    locks: Arc<ResourceLockManager>,
    leases: Option<Arc<LeaseManager>>,
    registry: ActionRegistry,
    recorder: Recorder,
    guards: GuardEvaluator,
    clock: SharedClock,
    config: RunnerConfig,
    /// Cancellation tokens keyed by job_id, present while a run is active.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl<S: JobStateStore> PlanRunner<S> {
    /// Create a runner with its own lock table, no lease manager, the system
    /// clock, and the built-in `sleep` and `record` actions.
    pub fn new(
        jobs: Arc<JobManager<S>>,
        telemetry: Arc<TelemetryStore>,
        logs: Arc<LoggingStore>,
        watchdog: Arc<Watchdog>,
    ) -> Self {
        let recorder = Recorder::new();
        let clock: SharedClock = Arc::new(SystemClock);
        Self {
            jobs,
            telemetry,
            logs,
            watchdog,
            locks: Arc::new(ResourceLockManager::new()),
            leases: None,
            registry: ActionRegistry::with_builtins(recorder.clone()),
            recorder,
            guards: GuardEvaluator::new(Arc::clone(&clock)),
            clock,
            config: RunnerConfig::default(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Share a lock table with other runners.
    pub fn with_locks(mut self, locks: Arc<ResourceLockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Consult and invalidate leases from `leases`.
    pub fn with_leases(mut self, leases: Arc<LeaseManager>) -> Self {
        self.leases = Some(leases);
        self
    }

    /// Register an action for `step_type`, replacing any existing one.
    pub fn with_action<T: StepAction + 'static>(
        mut self,
        step_type: impl Into<String>,
        action: T,
    ) -> Self {
        self.registry.register(step_type, action);
        self
    }

    /// Replace the whole action registry.
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Time source for guards, step contexts and log timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.guards = GuardEvaluator::new(Arc::clone(&clock));
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn jobs(&self) -> &Arc<JobManager<S>> {
        &self.jobs
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStore> {
        &self.telemetry
    }

    pub fn logs(&self) -> &Arc<LoggingStore> {
        &self.logs
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn locks(&self) -> &Arc<ResourceLockManager> {
        &self.locks
    }

    /// Values appended by the built-in `record` action.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Whether a run of `job_id` is in progress on this runner.
    pub fn is_running(&self, job_id: &str) -> bool {
        self.cancellation_tokens.contains_key(job_id)
    }

    /// Stop `job_id` with `final_state`, signal its active run (if any) to
    /// halt at the next step boundary, and release every lock it holds.
    ///
    /// Returns the number of locks released.
    pub fn cancel(&self, job_id: &str, final_state: JobState) -> Result<usize, EngineError> {
        self.jobs.stop(job_id, final_state, self.leases.as_deref())?;
        if let Some(token) = self.cancellation_tokens.get(job_id) {
            token.cancel();
        }
        let released = self.locks.release_all(job_id);
        tracing::info!(job_id, state = %final_state, released, "job cancelled");
        Ok(released)
    }

    /// Run `job_id` from its checkpoint.
    ///
    /// A FINISHED job is a no-op; a FAILED or HUNG job is reopened and
    /// resumed. Fails with `Validation` before any state change if a
    /// remaining step has no registered action or the job is already being
    /// run by this runner.
    pub async fn run(&self, job_id: &str, options: RunOptions) -> Result<RunOutcome, EngineError> {
        let span = tracing::info_span!("plan_run", job_id);
        self.run_inner(job_id, &options).instrument(span).await
    }

    async fn run_inner(&self, job_id: &str, options: &RunOptions) -> Result<RunOutcome, EngineError> {
        let status = self.jobs.status(job_id)?;
        if status.state == JobState::Finished {
            tracing::debug!("job already finished");
            return Ok(RunOutcome::Finished);
        }
        let plan = self.jobs.plan(job_id)?;
        let checkpoint = status.checkpoint.min(plan.len());

        if let Some(step) = plan.steps[checkpoint..]
            .iter()
            .find(|step| !self.registry.contains(&step.step_type))
        {
            return Err(EngineError::Validation(format!(
                "no action registered for step type '{}' (step '{}')",
                step.step_type, step.step_id
            )));
        }

        let token = match self.cancellation_tokens.entry(job_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::Validation(format!(
                    "job {job_id} is already running"
                )));
            }
            Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(token.clone());
                token
            }
        };
        let _active = ActiveRun {
            tokens: &self.cancellation_tokens,
            job_id,
        };

        let reopened = status.state != JobState::Running;
        if reopened {
            self.jobs.reopen(job_id)?;
        }

        let kind = if checkpoint > 0 || reopened {
            EventKind::JobResumed
        } else {
            EventKind::JobStarted
        };
        tracing::info!(
            plan_id = %plan.plan_id,
            checkpoint,
            total_steps = plan.len(),
            "job run starting"
        );
        self.emit(
            job_id,
            None,
            kind,
            json!({ "plan_id": plan.plan_id, "checkpoint": checkpoint, "total_steps": plan.len() }),
            options,
        );

        self.watchdog
            .begin_run(job_id, BudgetLimits::from(&plan.budgets));
        let result = self
            .execute_steps(job_id, &plan, checkpoint, options, &token)
            .await;
        if let Some(usage) = self.watchdog.end_run(job_id) {
            tracing::debug!(steps = usage.steps, retries = usage.retries, "run budget usage");
        }
        result
    }

    async fn execute_steps(
        &self,
        job_id: &str,
        plan: &Plan,
        checkpoint: usize,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let mut run_ctx = RunContext::new();

        for (index, step) in plan.steps.iter().enumerate().skip(checkpoint) {
            let state = self.jobs.status(job_id)?.state;
            if token.is_cancelled() || state != JobState::Running {
                tracing::info!(step_id = %step.step_id, %state, "job stopped externally, halting");
                return Ok(RunOutcome::Stopped { state });
            }

            if let Some(lease_id) = self.lost_lease(job_id) {
                tracing::warn!(lease_id = %lease_id, "lease expired, failing job");
                self.emit(
                    job_id,
                    Some(&step.step_id),
                    EventKind::JobFailed,
                    json!({ "reason": "lease expired", "lease_id": lease_id }),
                    options,
                );
                self.jobs
                    .stop(job_id, JobState::Failed, self.leases.as_deref())?;
                return Ok(RunOutcome::LeaseLost { lease_id });
            }

            match self
                .execute_step(job_id, index, step, &run_ctx, options, token)
                .await?
            {
                StepResult::Completed(output) => {
                    run_ctx.record_output(&step.step_id, output);
                    self.jobs.update_checkpoint(job_id, index + 1)?;
                    self.watchdog.record_progress(job_id);
                }
                StepResult::Halted(outcome) => return Ok(outcome),
            }
        }

        self.emit(
            job_id,
            None,
            EventKind::JobFinished,
            json!({ "steps": plan.len() }),
            options,
        );
        self.jobs
            .stop(job_id, JobState::Finished, self.leases.as_deref())?;
        tracing::info!("job finished");
        Ok(RunOutcome::Finished)
    }

    /// Run one step through its retry loop.
    async fn execute_step(
        &self,
        job_id: &str,
        index: usize,
        step: &Step,
        run_ctx: &RunContext,
        options: &RunOptions,
        token: &CancellationToken,
    ) -> Result<StepResult, EngineError> {
        let policy = RetryHandler::effective_policy(step, &self.config.default_retry);
        let mut step_ctx = run_ctx.for_step(job_id, index, step, self.clock.now());

        self.emit(
            job_id,
            Some(&step.step_id),
            EventKind::StartStep,
            json!({ "index": index, "type": step.step_type }),
            options,
        );

        let mut attempt = 1;
        loop {
            step_ctx.attempt = attempt;
            let error = match self.attempt_step(job_id, step, &step_ctx, options).await {
                Ok(Attempt::Done(output)) => {
                    self.emit(
                        job_id,
                        Some(&step.step_id),
                        EventKind::EndStep,
                        json!({ "index": index, "attempts": attempt }),
                        options,
                    );
                    return Ok(StepResult::Completed(output));
                }
                Ok(Attempt::Violation(violation)) => {
                    return self.halt_on_violation(job_id, step, violation, options);
                }
                Ok(Attempt::Fatal(message)) => EngineError::ActionFailure {
                    step_id: step.step_id.clone(),
                    message,
                },
                Err(err) if RetryHandler::should_retry(&policy, attempt, &err) => {
                    let delay = RetryHandler::backoff_delay(&policy, attempt);
                    tracing::warn!(
                        step_id = %step.step_id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step attempt failed, retrying"
                    );
                    self.emit(
                        job_id,
                        Some(&step.step_id),
                        EventKind::StepRetry,
                        json!({ "attempt": attempt, "delay_ms": delay.as_millis() as u64, "error": err.to_string() }),
                        options,
                    );
                    self.watchdog.record_retry(job_id);

                    tokio::select! {
                        _ = token.cancelled() => {
                            let state = self.jobs.status(job_id)?.state;
                            return Ok(StepResult::Halted(RunOutcome::Stopped { state }));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    continue;
                }
                Err(err) => err,
            };

            if token.is_cancelled() {
                let state = self.jobs.status(job_id)?.state;
                return Ok(StepResult::Halted(RunOutcome::Stopped { state }));
            }

            tracing::warn!(step_id = %step.step_id, attempt, error = %error, "step failed");
            self.emit(
                job_id,
                Some(&step.step_id),
                EventKind::JobFailed,
                json!({ "attempts": attempt, "error": error.to_string() }),
                options,
            );
            self.jobs
                .stop(job_id, JobState::Failed, self.leases.as_deref())?;
            return Ok(StepResult::Halted(RunOutcome::Failed {
                step_id: step.step_id.clone(),
                reason: error.to_string(),
            }));
        }
    }

    fn halt_on_violation(
        &self,
        job_id: &str,
        step: &Step,
        violation: WatchdogViolation,
        options: &RunOptions,
    ) -> Result<StepResult, EngineError> {
        let step_id = step.step_id.clone();
        let outcome = match &violation {
            WatchdogViolation::Hung { idle_ms, .. } => RunOutcome::Hung {
                step_id: step_id.clone(),
                idle_ms: *idle_ms,
            },
            WatchdogViolation::BudgetExceeded(reason) => RunOutcome::BudgetExceeded {
                step_id: step_id.clone(),
                reason: reason.clone(),
            },
        };
        let final_state = outcome.job_state();
        let kind = match final_state {
            JobState::Hung => EventKind::JobHung,
            _ => EventKind::JobFailed,
        };
        tracing::warn!(step_id = %step_id, %violation, to = %final_state, "watchdog violation");
        self.emit(
            job_id,
            Some(&step_id),
            kind,
            json!({ "reason": violation.to_string() }),
            options,
        );
        self.jobs
            .stop(job_id, final_state, self.leases.as_deref())?;
        Ok(StepResult::Halted(outcome))
    }

    /// One attempt: locks, guards, watchdog, action. Locks are released
    /// before returning whatever the result.
    async fn attempt_step(
        &self,
        job_id: &str,
        step: &Step,
        ctx: &StepContext,
        options: &RunOptions,
    ) -> Result<Attempt, EngineError> {
        let held = match self.acquire_locks(job_id, step) {
            Ok(held) => held,
            Err(err) => {
                self.emit(
                    job_id,
                    Some(&step.step_id),
                    EventKind::LockUnavailable,
                    json!({ "error": err.to_string() }),
                    options,
                );
                return Err(err);
            }
        };
        let result = self.guarded_execute(job_id, step, ctx, options).await;
        for resource in &held {
            self.locks.release(job_id, resource);
        }
        result
    }

    /// Acquire the step's locks in declared order. On contention, release
    /// whatever this call took and report the contended resource.
    fn acquire_locks(&self, job_id: &str, step: &Step) -> Result<Vec<String>, EngineError> {
        let mut held: Vec<String> = Vec::new();
        for request in step.effective_locks() {
            if self.locks.check_owner(job_id, &request.resource) {
                continue;
            }
            if !self.locks.acquire(
                job_id,
                &request.resource,
                request.mode,
                self.config.lock_timeout_ms,
            ) {
                for resource in &held {
                    self.locks.release(job_id, resource);
                }
                return Err(EngineError::LockUnavailable {
                    resource: request.resource,
                });
            }
            held.push(request.resource);
        }
        Ok(held)
    }

    async fn guarded_execute(
        &self,
        job_id: &str,
        step: &Step,
        ctx: &StepContext,
        options: &RunOptions,
    ) -> Result<Attempt, EngineError> {
        let verdict = self.guards.evaluate_step(&step.guards, ctx);
        if !verdict.ok {
            let reason = verdict.reason.unwrap_or_default();
            self.emit(
                job_id,
                Some(&step.step_id),
                EventKind::GuardFailed,
                json!({ "reason": reason }),
                options,
            );
            return Err(EngineError::GuardFailure {
                step_id: step.step_id.clone(),
                reason,
            });
        }

        if let Err(violation) = self.watchdog.check(job_id, options.progress_timeout_ms) {
            return Ok(Attempt::Violation(violation));
        }
        self.watchdog.record_step(job_id);

        let action = self.registry.get(&step.step_type).ok_or_else(|| {
            EngineError::Validation(format!(
                "no action registered for step type '{}'",
                step.step_type
            ))
        })?;
        let execution = action.execute(step, ctx);
        let result = match step.budget.as_ref().and_then(|b| b.timeout_ms) {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), execution)
                .await
                .unwrap_or_else(|_| Err(ActionError::Failed(format!("timed out after {ms}ms")))),
            None => execution.await,
        };

        match result {
            Ok(output) => Ok(Attempt::Done(output)),
            Err(ActionError::Fatal(message)) => Ok(Attempt::Fatal(message)),
            Err(ActionError::Failed(message)) => Err(EngineError::ActionFailure {
                step_id: step.step_id.clone(),
                message,
            }),
        }
    }

    /// The job's lease, if it expired by TTL while the job was running.
    fn lost_lease(&self, job_id: &str) -> Option<String> {
        let lease = self.leases.as_ref()?.lease_for_job(job_id)?;
        (lease.state == LeaseState::Expired && !lease.invalidated).then_some(lease.lease_id)
    }

    /// Record telemetry and write the matching log entry to every sink.
    /// Sink failures are logged and never fail the job.
    fn emit(
        &self,
        job_id: &str,
        step_id: Option<&str>,
        kind: EventKind,
        payload: Value,
        options: &RunOptions,
    ) {
        let message = match &payload {
            Value::Null => String::new(),
            Value::Object(map) if map.is_empty() => String::new(),
            other => other.to_string(),
        };
        let record = self.telemetry.record(job_id, step_id, kind, payload);
        let entry = LogEntry {
            timestamp: record.timestamp,
            job_id: job_id.to_string(),
            step_id: record.step_id,
            kind,
            message,
        };
        if let Err(e) = self.logs.append(&entry) {
            tracing::warn!(error = %e, event = %kind, "failed to append to logging store");
        }
        if let Some(sink) = &options.file_logger {
            if let Err(e) = sink.append(&entry) {
                tracing::warn!(error = %e, event = %kind, "failed to append to file logger");
            }
        }
    }
}

impl<S: JobStateStore> std::fmt::Debug for PlanRunner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanRunner")
            .field("actions", &self.registry.step_types())
            .field("leases", &self.leases.is_some())
            .field("active_runs", &self.cancellation_tokens.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    use plangate_types::lock::LockMode;
    use plangate_types::plan::{Guard, PlanBudget, StepBudget};

    use crate::action::NoopAction;
    use crate::clock::{Clock, ManualClock};
    use crate::repository::InMemoryStateStore;

    type TestRunner = PlanRunner<InMemoryStateStore>;

    fn runner() -> TestRunner {
        let clock: SharedClock = Arc::new(SystemClock);
        runner_with_clock(clock)
    }

    fn runner_with_clock(clock: SharedClock) -> TestRunner {
        let jobs = Arc::new(JobManager::open(InMemoryStateStore::new()).unwrap());
        let telemetry = Arc::new(TelemetryStore::new(Arc::clone(&clock)));
        let logs = Arc::new(LoggingStore::new());
        let watchdog = Arc::new(Watchdog::new(BudgetLimits::default(), Arc::clone(&clock)));
        PlanRunner::new(jobs, telemetry, logs, watchdog)
            .with_clock(clock)
            .with_action("touch", NoopAction)
    }

    fn record_plan(plan_id: &str, ids: &[&str]) -> Plan {
        Plan::new(
            plan_id,
            ids.iter()
                .map(|id| Step::new(*id, "record").with_payload("value", json!(id)))
                .collect(),
        )
    }

    /// Fails with a retryable error `failures` times, then succeeds.
    struct FlakyAction {
        failures: u32,
        calls: Arc<AtomicU32>,
    }

    impl StepAction for FlakyAction {
        async fn execute(&self, _step: &Step, _ctx: &StepContext) -> Result<Value, ActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(ActionError::Failed(format!("flaky call {call}")))
            } else {
                Ok(json!({ "call": call }))
            }
        }
    }

    struct FatalAction;

    impl StepAction for FatalAction {
        async fn execute(&self, _step: &Step, _ctx: &StepContext) -> Result<Value, ActionError> {
            Err(ActionError::Fatal("device unplugged".to_string()))
        }
    }

    #[tokio::test]
    async fn checkpoint_restart_runs_only_remaining_steps() {
        let runner = runner();
        let jobs = Arc::clone(runner.jobs());
        let job_id = jobs.start("p1", record_plan("p1", &["s1", "s2"]), "owner").unwrap();
        jobs.update_checkpoint(&job_id, 1).unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(runner.recorder().recorded(), vec!["s2".to_string()]);
        let status = jobs.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Finished);
        assert_eq!(status.checkpoint, 2);
    }

    #[tokio::test]
    async fn full_run_emits_ordered_telemetry_and_logs() {
        let runner = runner();
        let job_id = runner
            .jobs()
            .start("p1", record_plan("p1", &["s1", "s2"]), "owner")
            .unwrap();
        let extra = Arc::new(LoggingStore::new());

        let outcome = runner
            .run(&job_id, RunOptions::new().with_file_logger(extra.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(
            runner.telemetry().kinds_for(&job_id),
            vec![
                EventKind::JobStarted,
                EventKind::StartStep,
                EventKind::EndStep,
                EventKind::StartStep,
                EventKind::EndStep,
                EventKind::JobFinished,
            ]
        );
        let lines = extra.lines_for(&job_id);
        assert_eq!(lines.len(), 6);
        assert!(lines[1].contains("step=s1 event=start_step"));
        assert!(lines[5].contains("event=job_finished"));
        assert_eq!(runner.logs().lines_for(&job_id), lines);
        assert!(runner.locks().held_by(&job_id).is_empty());
    }

    #[tokio::test]
    async fn stale_progress_marks_job_hung() {
        let runner = runner();
        let jobs = Arc::clone(runner.jobs());
        let plan = Plan::new(
            "p2",
            vec![Step::new("s1", "sleep").with_payload("ms", json!(10))],
        );
        let job_id = jobs.start("p2", plan, "owner").unwrap();
        runner
            .watchdog()
            .set_last_progress_ts(&job_id, Utc::now() - ChronoDuration::milliseconds(200));

        let outcome = runner
            .run(&job_id, RunOptions::new().with_progress_timeout_ms(50))
            .await
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Hung { .. }));
        let status = jobs.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Hung);
        assert_eq!(status.checkpoint, 0);
        assert!(runner.telemetry().kinds_for(&job_id).contains(&EventKind::JobHung));
        assert!(runner.locks().held_by(&job_id).is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = runner().with_action(
            "flaky",
            FlakyAction {
                failures: 2,
                calls: Arc::clone(&calls),
            },
        );
        let plan = Plan::new(
            "p1",
            vec![Step::new("s1", "flaky").with_retry(RetryPolicy::fixed(3, 0))],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let retries = runner
            .telemetry()
            .kinds_for(&job_id)
            .into_iter()
            .filter(|k| *k == EventKind::StepRetry)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_then_rerun_resumes() {
        let calls = Arc::new(AtomicU32::new(0));
        let runner = runner().with_action(
            "flaky",
            FlakyAction {
                failures: 2,
                calls: Arc::clone(&calls),
            },
        );
        let plan = Plan::new(
            "p1",
            vec![
                Step::new("s0", "record"),
                Step::new("s1", "flaky").with_retry(RetryPolicy::fixed(2, 0)),
            ],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { ref step_id, .. } if step_id == "s1"));
        let status = runner.jobs().status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.checkpoint, 1);

        // Rerun reopens the job and resumes at s1 without repeating s0.
        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(runner.recorder().recorded(), vec!["s0".to_string()]);
        assert!(runner.telemetry().kinds_for(&job_id).contains(&EventKind::JobResumed));
    }

    #[tokio::test]
    async fn fatal_action_is_not_retried() {
        let runner = runner().with_action("fatal", FatalAction);
        let plan = Plan::new(
            "p1",
            vec![Step::new("s1", "fatal").with_retry(RetryPolicy::fixed(5, 0))],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        match outcome {
            RunOutcome::Failed { reason, .. } => assert!(reason.contains("device unplugged")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!runner.telemetry().kinds_for(&job_id).contains(&EventKind::StepRetry));
    }

    #[tokio::test]
    async fn contended_lock_fails_step_and_rolls_back() {
        let runner = runner();
        let plan = Plan::new(
            "p1",
            vec![Step::new("s1", "touch")
                .with_lock("screen", LockMode::Read)
                .with_lock("touch", LockMode::Exclusive)],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();
        assert!(runner.locks().acquire("other-job", "touch", LockMode::Exclusive, 0));

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        match outcome {
            RunOutcome::Failed { reason, .. } => assert!(reason.contains("touch")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(runner.telemetry().kinds_for(&job_id).contains(&EventKind::LockUnavailable));
        assert!(!runner.locks().check_owner(&job_id, "screen"));
        assert!(runner.locks().check_owner("other-job", "touch"));
    }

    #[tokio::test]
    async fn exclusive_lock_is_not_downgraded_by_read_declaration() {
        let runner = runner();
        let mixed = Plan::new(
            "p1",
            vec![Step::new("s1", "touch")
                .with_lock("screen", LockMode::Read)
                .with_lock("screen", LockMode::Exclusive)],
        );
        assert!(matches!(
            runner.jobs().start("p1", mixed, "owner"),
            Err(EngineError::Validation(_))
        ));

        let plan = Plan::new(
            "p1",
            vec![Step::new("s1", "touch").with_lock("screen", LockMode::Exclusive)],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();
        assert!(runner.locks().acquire("other-job", "screen", LockMode::Read, 0));

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Failed { ref reason, .. } if reason.contains("screen")));
        assert!(runner.locks().check_owner("other-job", "screen"));
        assert!(!runner.locks().check_owner(&job_id, "screen"));
    }

    #[tokio::test]
    async fn jobs_sharing_a_plan_id_run_their_own_steps() {
        let runner = runner();
        let first = runner
            .jobs()
            .start("p1", record_plan("p1", &["a1", "a2"]), "owner")
            .unwrap();
        let second = runner
            .jobs()
            .start("p1", record_plan("p1", &["b1"]), "owner")
            .unwrap();

        assert_eq!(runner.run(&first, RunOptions::new()).await.unwrap(), RunOutcome::Finished);
        assert_eq!(runner.recorder().recorded(), vec!["a1", "a2"]);
        assert_eq!(runner.jobs().status(&first).unwrap().checkpoint, 2);

        assert_eq!(runner.run(&second, RunOptions::new()).await.unwrap(), RunOutcome::Finished);
        assert_eq!(runner.recorder().recorded(), vec!["a1", "a2", "b1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_contention_clears_on_retry() {
        let runner = Arc::new(runner().with_config(RunnerConfig {
            lock_timeout_ms: 0,
            default_retry: RetryPolicy::fixed(50, 1),
        }));
        let plan = Plan::new("p1", vec![Step::new("s1", "touch")]);
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();
        assert!(runner.locks().acquire("other-job", "touch", LockMode::Exclusive, 0));

        let handle = {
            let runner = Arc::clone(&runner);
            let job_id = job_id.clone();
            tokio::spawn(async move { runner.run(&job_id, RunOptions::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        runner.locks().release("other-job", "touch");

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Finished);
    }

    #[tokio::test]
    async fn failed_guard_fails_step() {
        let runner = runner();
        let plan = Plan::new(
            "p1",
            vec![
                Step::new("s1", "record"),
                Step::new("s2", "record").with_guard(Guard::RequiresOutput {
                    step_id: "s1".to_string(),
                }),
            ],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();
        // Resuming past s1 means its output is not in this run's context.
        runner.jobs().update_checkpoint(&job_id, 1).unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        match outcome {
            RunOutcome::Failed { step_id, reason } => {
                assert_eq!(step_id, "s2");
                assert!(reason.contains("requires_output"), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(runner.telemetry().kinds_for(&job_id).contains(&EventKind::GuardFailed));
        assert!(runner.recorder().recorded().is_empty());
    }

    #[tokio::test]
    async fn guard_sees_output_from_same_run() {
        let runner = runner();
        let plan = Plan::new(
            "p1",
            vec![
                Step::new("s1", "record"),
                Step::new("s2", "record").with_guard(Guard::RequiresOutput {
                    step_id: "s1".to_string(),
                }),
            ],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();
        assert_eq!(
            runner.run(&job_id, RunOptions::new()).await.unwrap(),
            RunOutcome::Finished
        );
    }

    #[tokio::test]
    async fn step_budget_exhaustion_fails_job() {
        let runner = runner();
        let mut plan = record_plan("p1", &["s1", "s2", "s3"]);
        plan.budgets = PlanBudget {
            max_steps: Some(2),
            ..PlanBudget::default()
        };
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert!(matches!(outcome, RunOutcome::BudgetExceeded { ref step_id, .. } if step_id == "s3"));
        assert_eq!(outcome.job_state(), JobState::Failed);
        let status = runner.jobs().status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.checkpoint, 2);
        let kinds = runner.telemetry().kinds_for(&job_id);
        assert!(kinds.contains(&EventKind::JobFailed));
        assert!(!kinds.contains(&EventKind::JobHung));
    }

    #[tokio::test]
    async fn expired_lease_fails_job() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        let leases = Arc::new(LeaseManager::new(Arc::new(clock.clone())));
        let runner = runner_with_clock(Arc::new(clock.clone())).with_leases(Arc::clone(&leases));
        let job_id = runner
            .jobs()
            .start("p1", record_plan("p1", &["s1"]), "owner")
            .unwrap();
        leases.attach("lease1", &job_id, "ctl", 10, 5).unwrap();
        clock.advance_ms(20);

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert_eq!(
            outcome,
            RunOutcome::LeaseLost {
                lease_id: "lease1".to_string()
            }
        );
        assert_eq!(runner.jobs().status(&job_id).unwrap().state, JobState::Failed);
        assert!(leases.get("lease1").unwrap().invalidated);
        assert!(runner.recorder().recorded().is_empty());
    }

    #[tokio::test]
    async fn detached_lease_does_not_block_run() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(t0);
        let leases = Arc::new(LeaseManager::new(Arc::new(clock.clone())));
        let runner = runner_with_clock(Arc::new(clock.clone())).with_leases(Arc::clone(&leases));
        let job_id = runner
            .jobs()
            .start("p1", record_plan("p1", &["s1"]), "owner")
            .unwrap();
        leases.attach("lease1", &job_id, "ctl", 10, 5).unwrap();
        leases.detach("lease1").unwrap();
        clock.advance_ms(1_000);

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        // Finishing the job invalidates its lease.
        assert_eq!(leases.get("lease1").unwrap().state, LeaseState::Expired);
    }

    #[tokio::test]
    async fn unregistered_step_type_fails_fast() {
        let runner = runner();
        let plan = Plan::new("p1", vec![Step::new("s1", "swipe")]);
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let err = runner.run(&job_id, RunOptions::new()).await.unwrap_err();

        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(runner.jobs().status(&job_id).unwrap().state, JobState::Running);
        assert!(runner.telemetry().records_for(&job_id).is_empty());
        assert!(!runner.is_running(&job_id));
    }

    #[tokio::test]
    async fn finished_job_is_noop() {
        let runner = runner();
        let job_id = runner
            .jobs()
            .start("p1", record_plan("p1", &["s1"]), "owner")
            .unwrap();
        runner.run(&job_id, RunOptions::new()).await.unwrap();
        let events = runner.telemetry().len();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(runner.telemetry().len(), events);
        assert_eq!(runner.recorder().recorded().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_halts_at_next_step_boundary() {
        let runner = Arc::new(runner());
        let plan = Plan::new(
            "p1",
            vec![
                Step::new("s1", "sleep").with_payload("ms", json!(100)),
                Step::new("s2", "record"),
            ],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let handle = {
            let runner = Arc::clone(&runner);
            let job_id = job_id.clone();
            tokio::spawn(async move { runner.run(&job_id, RunOptions::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(runner.is_running(&job_id));
        runner.cancel(&job_id, JobState::Failed).unwrap();

        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(
            outcome,
            RunOutcome::Stopped {
                state: JobState::Failed
            }
        );
        // The in-flight step finished and was committed; s2 never ran.
        let status = runner.jobs().status(&job_id).unwrap();
        assert_eq!(status.checkpoint, 1);
        assert!(runner.recorder().recorded().is_empty());
        assert!(!runner.is_running(&job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_is_a_retryable_failure() {
        let runner = runner();
        let plan = Plan::new(
            "p1",
            vec![Step::new("s1", "sleep")
                .with_payload("ms", json!(1_000))
                .with_budget(StepBudget {
                    timeout_ms: Some(10),
                    max_retries: Some(1),
                })],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        match outcome {
            RunOutcome::Failed { reason, .. } => assert!(reason.contains("timed out after 10ms")),
            other => panic!("unexpected outcome {other:?}"),
        }
        let kinds = runner.telemetry().kinds_for(&job_id);
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::StepRetry).count(), 1);
    }

    #[tokio::test]
    async fn guard_timeout_uses_injected_clock() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(t0);

        /// Advances the shared clock as a side effect of running.
        struct SlowAction(ManualClock);
        impl StepAction for SlowAction {
            async fn execute(&self, _s: &Step, _c: &StepContext) -> Result<Value, ActionError> {
                self.0.advance_ms(500);
                Err(ActionError::Failed("not yet".to_string()))
            }
        }

        let runner = runner_with_clock(Arc::new(clock.clone()))
            .with_action("slow", SlowAction(clock.clone()));
        let plan = Plan::new(
            "p1",
            vec![Step::new("s1", "slow")
                .with_guard(Guard::TimeoutMs { timeout_ms: 100 })
                .with_retry(RetryPolicy::fixed(3, 0))],
        );
        let job_id = runner.jobs().start("p1", plan, "owner").unwrap();

        let outcome = runner.run(&job_id, RunOptions::new()).await.unwrap();

        // Second attempt is rejected by the guard; third as well.
        match outcome {
            RunOutcome::Failed { reason, .. } => assert!(reason.contains("timeout_ms"), "{reason}"),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(clock.now(), t0 + ChronoDuration::milliseconds(500));
    }
}
