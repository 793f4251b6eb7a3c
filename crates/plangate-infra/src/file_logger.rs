//! Per-job log files with size-based rotation.
//!
//! Each job appends to `{dir}/{job_id}.log`, one line per event. When an
//! append would push the file past `max_bytes`, the current file is renamed to
//! `{job_id}.log.1` (replacing any older rotation) and a fresh file is started.
//!
//! Job IDs become file names, so IDs that could name a path outside the log
//! directory are rejected.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use plangate_core::logging::LogSink;
use plangate_types::error::EngineError;
use plangate_types::telemetry::LogEntry;

/// Rotating file sink for job logs.
#[derive(Debug)]
pub struct FileLogger {
    dir: PathBuf,
    max_bytes: u64,
    /// Serializes the size check, rotation and append.
    write_lock: Mutex<()>,
}

impl FileLogger {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the active log file for `job_id`.
    pub fn get_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.log"))
    }

    /// Path of the rotated log file for `job_id`.
    pub fn rotated_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.log.1"))
    }

    /// Append one raw line for `job_id`.
    pub fn append_line(&self, job_id: &str, line: &str) -> Result<(), EngineError> {
        check_job_id(job_id)?;
        let _guard = self.write_lock.lock().expect("file logger lock poisoned");
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            EngineError::Storage(format!("failed to create {}: {e}", self.dir.display()))
        })?;

        let path = self.get_path(job_id);
        let mut data = line.replace('\n', " ");
        data.push('\n');

        let current = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if current > 0 && current + data.len() as u64 > self.max_bytes {
            let rotated = self.rotated_path(job_id);
            std::fs::rename(&path, &rotated).map_err(|e| {
                EngineError::Storage(format!("failed to rotate {}: {e}", path.display()))
            })?;
            tracing::debug!(job_id, rotated = %rotated.display(), "job log rotated");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::Storage(format!("failed to open {}: {e}", path.display())))?;
        file.write_all(data.as_bytes())
            .map_err(|e| EngineError::Storage(format!("failed to write {}: {e}", path.display())))
    }

    /// Lines of the active log file for `job_id`. Empty when none exists.
    pub fn read_lines(&self, job_id: &str) -> Result<Vec<String>, EngineError> {
        check_job_id(job_id)?;
        let path = self.get_path(job_id);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(EngineError::Storage(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }
}

fn check_job_id(job_id: &str) -> Result<(), EngineError> {
    if job_id.is_empty()
        || job_id == "."
        || job_id.contains("..")
        || job_id.contains(['/', '\\', '\0'])
    {
        return Err(EngineError::Validation(format!(
            "job id {job_id:?} cannot be used as a log file name"
        )));
    }
    Ok(())
}

impl LogSink for FileLogger {
    fn append(&self, entry: &LogEntry) -> Result<(), EngineError> {
        self.append_line(&entry.job_id, &entry.to_line())
    }
}
