//! Job state storage port.
//!
//! Job records and the plans they execute are persisted together as one
//! snapshot. Each job keeps its own copy of its plan, keyed by `job_id`. Saving replaces the whole snapshot, so an implementation only
//! has to make a single write atomic to keep checkpoints consistent.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use plangate_types::error::RepositoryError;
use plangate_types::job::JobRecord;
use plangate_types::plan::Plan;

/// Version tag written into every snapshot.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Everything the job manager persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    #[serde(default)]
    pub jobs: HashMap<String, JobRecord>,
    /// Plan of each job, keyed by `job_id`.
    #[serde(default)]
    pub plans: HashMap<String, Plan>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: STATE_FORMAT_VERSION,
            jobs: HashMap::new(),
            plans: HashMap::new(),
        }
    }
}

/// Durable backing store for job state.
///
/// `load` on a store that has never been written returns an empty snapshot.
/// `save` must either persist the whole snapshot or leave the previous one
/// intact.
pub trait JobStateStore: Send + Sync {
    fn load(&self) -> Result<StateSnapshot, RepositoryError>;

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), RepositoryError>;
}

/// Volatile store for tests and embedding.
///
/// `fail_saves` makes subsequent writes fail, to exercise rollback paths.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    snapshot: Mutex<Option<StateSnapshot>>,
    fail_saves: Mutex<bool>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot, as if it had been written earlier.
    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            fail_saves: Mutex::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().expect("state store lock poisoned") = fail;
    }

    /// The last successfully saved snapshot.
    pub fn saved(&self) -> Option<StateSnapshot> {
        self.snapshot.lock().expect("state store lock poisoned").clone()
    }
}

impl JobStateStore for InMemoryStateStore {
    fn load(&self) -> Result<StateSnapshot, RepositoryError> {
        Ok(self.saved().unwrap_or_default())
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), RepositoryError> {
        if *self.fail_saves.lock().expect("state store lock poisoned") {
            return Err(RepositoryError::Io("simulated write failure".to_string()));
        }
        *self.snapshot.lock().expect("state store lock poisoned") = Some(snapshot.clone());
        Ok(())
    }
}

impl<S: JobStateStore + ?Sized> JobStateStore for std::sync::Arc<S> {
    fn load(&self) -> Result<StateSnapshot, RepositoryError> {
        (**self).load()
    }

    fn save(&self, snapshot: &StateSnapshot) -> Result<(), RepositoryError> {
        (**self).save(snapshot)
    }
}
