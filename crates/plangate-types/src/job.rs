//! Job records: the durable, resumable run of a plan.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Running,
    Finished,
    Failed,
    Hung,
}

impl JobState {
    /// Whether the job has stopped (for now; FAILED/HUNG jobs can be re-run).
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "RUNNING",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Hung => "HUNG",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted record of a job, one per `job_id` in the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub plan_id: String,
    /// Identity of whoever started the job.
    pub owner: String,
    pub state: JobState,
    /// Index of the next step to execute (0-based).
    pub checkpoint: usize,
    /// Back-reference to the lease currently bound to this job, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read-only snapshot returned by `JobManager::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub plan_id: String,
    pub owner: String,
    pub state: JobState,
    pub checkpoint: usize,
    /// Number of steps in the job's plan.
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}
