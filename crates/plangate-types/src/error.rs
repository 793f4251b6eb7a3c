use thiserror::Error;

/// Errors raised by the execution engine.
///
/// `NotFound` and `Validation` indicate caller misuse and propagate out of
/// `JobManager`/`LeaseManager` unchanged. Guard, lock and action failures are
/// handled by the runner's retry loop; watchdog violations are fatal to the
/// job and never retried.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("guard rejected step '{step_id}': {reason}")]
    GuardFailure { step_id: String, reason: String },

    #[error("resource '{resource}' unavailable")]
    LockUnavailable { resource: String },

    #[error("watchdog violation: {0}")]
    WatchdogViolation(WatchdogViolation),

    #[error("step '{step_id}' action failed: {message}")]
    ActionFailure { step_id: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn job_not_found(job_id: &str) -> Self {
        EngineError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        }
    }

    pub fn lease_not_found(lease_id: &str) -> Self {
        EngineError::NotFound {
            entity: "lease",
            id: lease_id.to_string(),
        }
    }

    /// Whether the runner may retry the step after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::GuardFailure { .. }
                | EngineError::LockUnavailable { .. }
                | EngineError::ActionFailure { .. }
        )
    }
}

/// Why the watchdog stopped a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchdogViolation {
    #[error("no progress for {idle_ms}ms (limit {progress_timeout_ms}ms)")]
    Hung {
        idle_ms: u64,
        progress_timeout_ms: u64,
    },

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
}

/// Errors from storage ports (the job state store).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("corrupt state: {0}")]
    Corrupt(String),
}

impl From<RepositoryError> for EngineError {
    fn from(err: RepositoryError) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Errors returned by step actions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    /// Recoverable failure; the runner may retry per the step's policy.
    #[error("{0}")]
    Failed(String),

    /// Unrecoverable failure; the step fails without further attempts.
    #[error("fatal: {0}")]
    Fatal(String),
}
