//! Per-job log sinks.
//!
//! The runner writes one [`LogEntry`] per event to the engine's in-memory
//! [`LoggingStore`] and, when the caller supplies one, to an extra sink such
//! as the file logger in plangate-infra.

use std::sync::Mutex;

use plangate_types::error::EngineError;
use plangate_types::telemetry::LogEntry;

/// Destination for job log entries.
pub trait LogSink: Send + Sync {
    fn append(&self, entry: &LogEntry) -> Result<(), EngineError>;
}

/// Append-only in-memory log.
#[derive(Debug, Default)]
pub struct LoggingStore {
    entries: Mutex<Vec<LogEntry>>,
}

impl LoggingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("logging store lock poisoned").clone()
    }

    pub fn entries_for(&self, job_id: &str) -> Vec<LogEntry> {
        self.entries
            .lock()
            .expect("logging store lock poisoned")
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Rendered lines for one job.
    pub fn lines_for(&self, job_id: &str) -> Vec<String> {
        self.entries_for(job_id).iter().map(LogEntry::to_line).collect()
    }
}

impl LogSink for LoggingStore {
    fn append(&self, entry: &LogEntry) -> Result<(), EngineError> {
        self.entries
            .lock()
            .expect("logging store lock poisoned")
            .push(entry.clone());
        Ok(())
    }
}
