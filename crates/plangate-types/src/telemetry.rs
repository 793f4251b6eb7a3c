//! Telemetry records and log entries emitted by the plan runner.
//!
//! Both are append-only and never mutated after they are recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of engine event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobStarted,
    JobResumed,
    StartStep,
    EndStep,
    StepRetry,
    GuardFailed,
    LockUnavailable,
    JobFinished,
    JobFailed,
    JobHung,
}

impl EventKind {
    /// The token written to log lines for this event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::JobStarted => "job_started",
            EventKind::JobResumed => "job_resumed",
            EventKind::StartStep => "start_step",
            EventKind::EndStep => "end_step",
            EventKind::StepRetry => "step_retry",
            EventKind::GuardFailed => "guard_failed",
            EventKind::LockUnavailable => "lock_unavailable",
            EventKind::JobFinished => "job_finished",
            EventKind::JobFailed => "job_failed",
            EventKind::JobHung => "job_hung",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Position in the store (0-based, strictly increasing).
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

/// A log entry handed to every `LogSink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl LogEntry {
    /// Render the entry as a single UTF-8 text line (no trailing newline).
    pub fn to_line(&self) -> String {
        let step = self.step_id.as_deref().unwrap_or("-");
        let mut line = format!(
            "{} job={} step={} event={}",
            self.timestamp.to_rfc3339(),
            self.job_id,
            step,
            self.kind
        );
        if !self.message.is_empty() {
            line.push(' ');
            line.push_str(&self.message.replace('\n', " "));
        }
        line
    }
}
