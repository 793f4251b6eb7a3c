//! Engine assembly: wires every component from an [`EngineConfig`].
//!
//! One `Engine` owns the durable job manager (backed by [`JsonStateFile`]),
//! the shared lock table, lease manager, watchdog, telemetry and log sinks,
//! and a [`PlanRunner`] over all of them.
//!
//! The engine only emits `tracing` events and spans; a host process installs
//! the subscriber, typically with `plangate_observe::tracing_setup::init_tracing`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use plangate_core::action::StepAction;
use plangate_core::clock::{SharedClock, SystemClock};
use plangate_core::definition::load_plan;
use plangate_core::job::JobManager;
use plangate_core::lease::LeaseManager;
use plangate_core::lock::ResourceLockManager;
use plangate_core::logging::LoggingStore;
use plangate_core::runner::{PlanRunner, RunOptions, RunOutcome, RunnerConfig};
use plangate_core::telemetry::TelemetryStore;
use plangate_core::watchdog::{BudgetLimits, Watchdog};
use plangate_types::config::EngineConfig;
use plangate_types::error::EngineError;
use plangate_types::lease::Lease;
use plangate_types::plan::{Plan, RetryPolicy};

use crate::config::{load_engine_config, resolve_path};
use crate::file_logger::FileLogger;
use crate::state_file::JsonStateFile;

/// A fully wired plangate engine rooted at a data directory.
pub struct Engine {
    data_dir: PathBuf,
    config: EngineConfig,
    jobs: Arc<JobManager<JsonStateFile>>,
    leases: Arc<LeaseManager>,
    locks: Arc<ResourceLockManager>,
    file_logger: Arc<FileLogger>,
    runner: PlanRunner<JsonStateFile>,
}

impl Engine {
    /// Open the engine at `data_dir`, reading `plangate.toml` if present.
    pub async fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let config = load_engine_config(data_dir).await;
        Self::with_config(data_dir, config, Arc::new(SystemClock))
    }

    /// Build the engine from an explicit configuration and clock.
    pub fn with_config(
        data_dir: &Path,
        config: EngineConfig,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        let state_path = resolve_path(data_dir, &config.state_path);
        let log_dir = resolve_path(data_dir, &config.log_dir);

        let jobs = Arc::new(
            JobManager::open(JsonStateFile::new(&state_path))
                .with_context(|| format!("Failed to load job state from {}", state_path.display()))?,
        );
        let telemetry = Arc::new(TelemetryStore::with_capacity(
            Arc::clone(&clock),
            config.telemetry_capacity,
        ));
        let logs = Arc::new(LoggingStore::new());
        let watchdog = Arc::new(Watchdog::new(
            BudgetLimits::from(&config.budgets),
            Arc::clone(&clock),
        ));
        let locks = Arc::new(ResourceLockManager::new());
        let leases = Arc::new(LeaseManager::with_config(
            Arc::clone(&clock),
            config.leases.clone(),
        ));
        let file_logger = Arc::new(FileLogger::new(log_dir, config.log_max_bytes));

        let runner = PlanRunner::new(Arc::clone(&jobs), telemetry, logs, watchdog)
            .with_clock(clock)
            .with_locks(Arc::clone(&locks))
            .with_leases(Arc::clone(&leases))
            .with_config(RunnerConfig {
                lock_timeout_ms: config.lock_timeout_ms,
                default_retry: RetryPolicy::no_retry(),
            });

        tracing::info!(
            data_dir = %data_dir.display(),
            state_path = %state_path.display(),
            jobs = jobs.list().len(),
            "engine opened"
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            jobs,
            leases,
            locks,
            file_logger,
            runner,
        })
    }

    /// Register an extra step action on the engine's runner.
    pub fn with_action<T: StepAction + 'static>(
        mut self,
        step_type: impl Into<String>,
        action: T,
    ) -> Self {
        self.runner = self.runner.with_action(step_type, action);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<JobManager<JsonStateFile>> {
        &self.jobs
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn locks(&self) -> &Arc<ResourceLockManager> {
        &self.locks
    }

    pub fn runner(&self) -> &PlanRunner<JsonStateFile> {
        &self.runner
    }

    pub fn file_logger(&self) -> &Arc<FileLogger> {
        &self.file_logger
    }

    /// Start a job for `plan`, keyed by the plan's own ID.
    pub fn start_job(&self, plan: Plan, owner: &str) -> Result<String, EngineError> {
        let plan_id = plan.plan_id.clone();
        self.jobs.start(&plan_id, plan, owner)
    }

    /// Load a plan from disk and start a job for it.
    pub fn start_job_from_file(&self, path: &Path, owner: &str) -> Result<String, EngineError> {
        self.start_job(load_plan(path)?, owner)
    }

    /// Options that route logs to the job's file and apply the configured
    /// progress timeout.
    pub fn run_options(&self) -> RunOptions {
        let mut options = RunOptions::new().with_file_logger(self.file_logger.clone());
        options.progress_timeout_ms = self.config.progress_timeout_ms;
        options
    }

    /// Run a job with [`Engine::run_options`].
    pub async fn run_job(&self, job_id: &str) -> Result<RunOutcome, EngineError> {
        self.runner.run(job_id, self.run_options()).await
    }

    /// Attach a lease with the configured TTL and heartbeat interval and link
    /// it to the job record.
    pub fn attach_lease(
        &self,
        job_id: &str,
        lease_id: &str,
        owner: &str,
    ) -> Result<Lease, EngineError> {
        let status = self.jobs.status(job_id)?;
        if status.state.is_terminal() {
            return Err(EngineError::Validation(format!(
                "cannot attach a lease to {} job {job_id}",
                status.state
            )));
        }
        let lease = self.leases.attach_default(lease_id, job_id, owner)?;
        self.jobs.link_lease(job_id, Some(lease_id))?;
        Ok(lease)
    }

    /// Release locks still held by RUNNING jobs, as left behind by a runner
    /// that stopped mid-step. Returns the affected job IDs, oldest first.
    pub fn recover(&self) -> Vec<String> {
        let mut recovered = Vec::new();
        for job in self.jobs.running_jobs() {
            if self.runner.is_running(&job.job_id) {
                continue;
            }
            let released = self.locks.release_all(&job.job_id);
            tracing::info!(
                job_id = %job.job_id,
                checkpoint = job.checkpoint,
                released,
                "recovered running job"
            );
            recovered.push(job.job_id);
        }
        recovered
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
