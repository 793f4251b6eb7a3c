//! Budget enforcement and hang detection.
//!
//! The watchdog tracks two independent things:
//! - **liveness**: a per-job `last_progress_ts`, advanced only when one of
//!   that job's steps completes. A job that has made no progress for longer
//!   than the progress timeout is declared hung, however much budget remains.
//!   Progress of one job never resets another job's timer.
//! - **budget usage** per job run: elapsed wall-clock time, steps executed and
//!   retries taken, checked against `BudgetLimits`.
//!
//! Nothing here runs on a timer; every verdict is computed on demand from the
//! stored timestamps and the injected clock.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use plangate_types::config::BudgetConfig;
use plangate_types::error::WatchdogViolation;
use plangate_types::plan::PlanBudget;

use crate::clock::{elapsed_ms, SharedClock};

/// Upper bounds on a single job run. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetLimits {
    pub max_total_ms: Option<u64>,
    pub max_steps: Option<u32>,
    pub max_retries: Option<u32>,
}

impl BudgetLimits {
    /// Combine two sets of limits, keeping the tighter bound of each.
    pub fn tighten(self, other: BudgetLimits) -> BudgetLimits {
        fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, None) => a,
                (None, b) => b,
            }
        }
        BudgetLimits {
            max_total_ms: min_opt(self.max_total_ms, other.max_total_ms),
            max_steps: min_opt(self.max_steps, other.max_steps),
            max_retries: min_opt(self.max_retries, other.max_retries),
        }
    }
}

impl From<&PlanBudget> for BudgetLimits {
    fn from(budget: &PlanBudget) -> Self {
        Self {
            max_total_ms: budget.max_duration_ms,
            max_steps: budget.max_steps,
            max_retries: budget.max_retries,
        }
    }
}

impl From<&BudgetConfig> for BudgetLimits {
    fn from(config: &BudgetConfig) -> Self {
        Self {
            max_total_ms: config.max_total_ms,
            max_steps: config.max_steps,
            max_retries: config.max_retries,
        }
    }
}

/// What one job run has consumed so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetUsage {
    pub started_at: DateTime<Utc>,
    pub steps: u32,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy)]
struct RunBudget {
    limits: BudgetLimits,
    usage: BudgetUsage,
}

/// Liveness and budget monitor shared by a runner.
#[derive(Debug)]
pub struct Watchdog {
    limits: BudgetLimits,
    clock: SharedClock,
    /// Last forward progress per job, present from `begin_run` (or an
    /// explicit override) until `end_run`.
    last_progress: DashMap<String, DateTime<Utc>>,
    runs: DashMap<String, RunBudget>,
}

impl Watchdog {
    pub fn new(limits: BudgetLimits, clock: SharedClock) -> Self {
        Self {
            limits,
            clock,
            last_progress: DashMap::new(),
            runs: DashMap::new(),
        }
    }

    pub fn limits(&self) -> BudgetLimits {
        self.limits
    }

    pub fn last_progress_ts(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.last_progress.get(job_id).map(|ts| *ts)
    }

    /// Override the last progress instant of `job_id` (used when restoring
    /// a job whose progress is already stale). Survives the next `begin_run`.
    pub fn set_last_progress_ts(&self, job_id: &str, ts: DateTime<Utc>) {
        self.last_progress.insert(job_id.to_string(), ts);
    }

    /// Mark forward progress for `job_id`: one of its steps completed.
    pub fn record_progress(&self, job_id: &str) {
        self.set_last_progress_ts(job_id, self.clock.now());
    }

    /// Start budget accounting for a run of `job_id`, with `plan_limits`
    /// tightened against the watchdog's own limits. The job's progress timer
    /// starts now unless an override is already in place.
    pub fn begin_run(&self, job_id: &str, plan_limits: BudgetLimits) {
        let now = self.clock.now();
        let run = RunBudget {
            limits: self.limits.tighten(plan_limits),
            usage: BudgetUsage {
                started_at: now,
                steps: 0,
                retries: 0,
            },
        };
        self.runs.insert(job_id.to_string(), run);
        self.last_progress.entry(job_id.to_string()).or_insert(now);
    }

    /// Stop budget and progress accounting for `job_id`.
    pub fn end_run(&self, job_id: &str) -> Option<BudgetUsage> {
        self.last_progress.remove(job_id);
        self.runs.remove(job_id).map(|(_, run)| run.usage)
    }

    pub fn usage(&self, job_id: &str) -> Option<BudgetUsage> {
        self.runs.get(job_id).map(|run| run.usage)
    }

    /// Count a step about to execute.
    pub fn record_step(&self, job_id: &str) {
        if let Some(mut run) = self.runs.get_mut(job_id) {
            run.usage.steps += 1;
        }
    }

    /// Count a retry attempt.
    pub fn record_retry(&self, job_id: &str) {
        if let Some(mut run) = self.runs.get_mut(job_id) {
            run.usage.retries += 1;
        }
    }

    /// Check liveness and budgets before a step attempt.
    ///
    /// Hang detection takes precedence over budget exhaustion. `steps` is
    /// compared with `>=` because the check guards the *next* step.
    pub fn check(
        &self,
        job_id: &str,
        progress_timeout_ms: Option<u64>,
    ) -> Result<(), WatchdogViolation> {
        let now = self.clock.now();

        let last_progress = self.last_progress_ts(job_id);
        if let (Some(timeout), Some(last_progress)) = (progress_timeout_ms, last_progress) {
            let idle_ms = elapsed_ms(last_progress, now);
            if idle_ms > timeout {
                return Err(WatchdogViolation::Hung {
                    idle_ms,
                    progress_timeout_ms: timeout,
                });
            }
        }

        let Some(run) = self.runs.get(job_id).map(|run| *run) else {
            return Ok(());
        };

        if let Some(max) = run.limits.max_total_ms {
            let elapsed = elapsed_ms(run.usage.started_at, now);
            if elapsed > max {
                return Err(WatchdogViolation::BudgetExceeded(format!(
                    "run time {elapsed}ms exceeds {max}ms"
                )));
            }
        }
        if let Some(max) = run.limits.max_steps {
            if run.usage.steps >= max {
                return Err(WatchdogViolation::BudgetExceeded(format!(
                    "step budget of {max} exhausted"
                )));
            }
        }
        if let Some(max) = run.limits.max_retries {
            if run.usage.retries > max {
                return Err(WatchdogViolation::BudgetExceeded(format!(
                    "{} retries exceed limit of {max}",
                    run.usage.retries
                )));
            }
        }

        Ok(())
    }
}
