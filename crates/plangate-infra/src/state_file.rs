//! JSON state file implementing the `JobStateStore` port.
//!
//! The whole snapshot is rewritten on every save. The new content is written
//! to a temp file in the same directory and renamed over the old file, so a
//! crash mid-write leaves the previous snapshot readable.

use std::io::Write;
use std::path::{Path, PathBuf};

use plangate_core::repository::{JobStateStore, StateSnapshot, STATE_FORMAT_VERSION};
use plangate_types::error::RepositoryError;

/// File-backed job state store.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobStateStore for JsonStateFile {
    fn load(&self) -> Result<StateSnapshot, RepositoryError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no state file, starting empty");
                return Ok(StateSnapshot::default());
            }
            Err(err) => {
                return Err(RepositoryError::Io(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )));
            }
        };

        if content.trim().is_empty() {
            return Ok(StateSnapshot::default());
        }

        let snapshot: StateSnapshot = serde_json::from_str(&content).map_err(|e| {
            RepositoryError::Corrupt(format!("{}: {e}", self.path.display()))
        })?;
        if snapshot.version > STATE_FORMAT_VERSION {
            return Err(RepositoryError::Corrupt(format!(
                "{}: unsupported state format version {}",
                self.path.display(),
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), RepositoryError> {
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| RepositoryError::Corrupt(format!("failed to serialize state: {e}")))?;
        write_atomic(&self.path, &content)
    }
}

/// Replace `path` with `content` via a same-directory temp file and rename.
fn write_atomic(path: &Path, content: &str) -> Result<(), RepositoryError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(|e| {
        RepositoryError::Io(format!("failed to create {}: {e}", parent.display()))
    })?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| RepositoryError::Io(format!("failed to create temp file: {e}")))?;
    temp_file
        .write_all(content.as_bytes())
        .and_then(|()| temp_file.as_file().sync_all())
        .map_err(|e| RepositoryError::Io(format!("failed to write temp file: {e}")))?;
    temp_file.persist(path).map_err(|e| {
        RepositoryError::Io(format!("failed to persist {}: {}", path.display(), e.error))
    })?;
    Ok(())
}
