//! Durable job records and checkpoints.
//!
//! `JobManager` is the single owner of job state for a process. It is
//! constructed from a [`JobStateStore`], keeps the snapshot in memory, and
//! flushes the whole snapshot synchronously on every mutation. A mutation
//! whose flush fails is rolled back, so `status` only ever reports state
//! that has been durably committed.
//!
//! Checkpoints are monotonic: once `update_checkpoint(job, i)` returns, no
//! step with index `< i` is executed again for that job.

use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use plangate_types::error::EngineError;
use plangate_types::job::{JobRecord, JobState, JobStatus};
use plangate_types::plan::Plan;

use crate::definition::validate_plan;
use crate::lease::LeaseManager;
use crate::repository::{JobStateStore, StateSnapshot};

/// Process-wide job state backed by a durable store.
#[derive(Debug)]
pub struct JobManager<S: JobStateStore> {
    store: S,
    state: Mutex<StateSnapshot>,
}

impl<S: JobStateStore> JobManager<S> {
    /// Load existing state from `store`.
    pub fn open(store: S) -> Result<Self, EngineError> {
        let snapshot = store.load()?;
        tracing::debug!(
            jobs = snapshot.jobs.len(),
            plans = snapshot.plans.len(),
            "job state loaded"
        );
        Ok(Self {
            store,
            state: Mutex::new(snapshot),
        })
    }

    /// Apply `mutate` to the snapshot and flush it, restoring the previous
    /// snapshot if the flush fails.
    fn commit<T>(
        &self,
        mutate: impl FnOnce(&mut StateSnapshot) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut state = self.state.lock().expect("job state lock poisoned");
        let previous = state.clone();
        let value = match mutate(&mut *state) {
            Ok(value) => value,
            Err(e) => {
                *state = previous;
                return Err(e);
            }
        };
        if let Err(e) = self.store.save(&*state) {
            *state = previous;
            tracing::warn!(error = %e, "job state flush failed, change rolled back");
            return Err(e.into());
        }
        Ok(value)
    }

    fn read<T>(&self, f: impl FnOnce(&StateSnapshot) -> T) -> T {
        let state = self.state.lock().expect("job state lock poisoned");
        f(&*state)
    }

    /// Create a RUNNING job at checkpoint 0 and persist it.
    pub fn start(&self, plan_id: &str, plan: Plan, owner: &str) -> Result<String, EngineError> {
        if plan.plan_id != plan_id {
            return Err(EngineError::Validation(format!(
                "plan_id '{plan_id}' does not match plan '{}'",
                plan.plan_id
            )));
        }
        validate_plan(&plan)?;

        let job_id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            plan_id: plan_id.to_string(),
            owner: owner.to_string(),
            state: JobState::Running,
            checkpoint: 0,
            lease_id: None,
            created_at: now,
            updated_at: now,
        };

        self.commit(|state| {
            state.plans.insert(job_id.clone(), plan);
            state.jobs.insert(job_id.clone(), record);
            Ok(())
        })?;

        tracing::info!(job_id = %job_id, plan_id, owner, "job started");
        Ok(job_id)
    }

    /// Advance the checkpoint to `index` (the next step to execute).
    ///
    /// Durable before returning. Moving backwards or past the end of the
    /// plan is rejected.
    pub fn update_checkpoint(&self, job_id: &str, index: usize) -> Result<(), EngineError> {
        self.commit(|state| {
            let total = state.plans.get(job_id).map(Plan::len);
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            if index < job.checkpoint {
                return Err(EngineError::Validation(format!(
                    "checkpoint for job {job_id} cannot move back from {} to {index}",
                    job.checkpoint
                )));
            }
            if let Some(total) = total {
                if index > total {
                    return Err(EngineError::Validation(format!(
                        "checkpoint {index} is past the end of a {total}-step plan"
                    )));
                }
            }
            job.checkpoint = index;
            job.updated_at = Utc::now();
            Ok(())
        })?;
        tracing::debug!(job_id, checkpoint = index, "checkpoint committed");
        Ok(())
    }

    /// Read-only snapshot of a job.
    pub fn status(&self, job_id: &str) -> Result<JobStatus, EngineError> {
        self.read(|state| {
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            let total_steps = state.plans.get(job_id).map(Plan::len).unwrap_or(0);
            Ok(JobStatus {
                job_id: job.job_id.clone(),
                plan_id: job.plan_id.clone(),
                owner: job.owner.clone(),
                state: job.state,
                checkpoint: job.checkpoint,
                total_steps,
                lease_id: job.lease_id.clone(),
                updated_at: job.updated_at,
            })
        })
    }

    /// Move a job to a terminal state.
    ///
    /// When `leases` is supplied, every lease on the job is forced to
    /// EXPIRED and the job's lease link is cleared.
    pub fn stop(
        &self,
        job_id: &str,
        final_state: JobState,
        leases: Option<&LeaseManager>,
    ) -> Result<(), EngineError> {
        if !final_state.is_terminal() {
            return Err(EngineError::Validation(format!(
                "cannot stop job {job_id} with non-terminal state {final_state}"
            )));
        }
        let previous = self.commit(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            let previous = job.state;
            job.state = final_state;
            if leases.is_some() {
                job.lease_id = None;
            }
            job.updated_at = Utc::now();
            Ok(previous)
        })?;

        if let Some(leases) = leases {
            leases.invalidate_job(job_id);
        }
        tracing::info!(job_id, from = %previous, to = %final_state, "job stopped");
        Ok(())
    }

    /// Return a stopped job to RUNNING so it can resume at its checkpoint.
    ///
    /// FINISHED jobs cannot be reopened.
    pub fn reopen(&self, job_id: &str) -> Result<(), EngineError> {
        self.commit(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            if job.state == JobState::Finished {
                return Err(EngineError::Validation(format!(
                    "job {job_id} is finished and cannot be reopened"
                )));
            }
            job.state = JobState::Running;
            job.updated_at = Utc::now();
            Ok(())
        })?;
        tracing::info!(job_id, "job reopened");
        Ok(())
    }

    /// Record the lease currently controlling a job.
    pub fn link_lease(&self, job_id: &str, lease_id: Option<&str>) -> Result<(), EngineError> {
        self.commit(|state| {
            let job = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            job.lease_id = lease_id.map(str::to_string);
            job.updated_at = Utc::now();
            Ok(())
        })
    }

    /// The plan a job executes.
    pub fn plan(&self, job_id: &str) -> Result<Plan, EngineError> {
        self.read(|state| {
            let job = state
                .jobs
                .get(job_id)
                .ok_or_else(|| EngineError::job_not_found(job_id))?;
            state.plans.get(job_id).cloned().ok_or_else(|| EngineError::NotFound {
                entity: "plan",
                id: job.plan_id.clone(),
            })
        })
    }

    /// Raw record for a job.
    pub fn get(&self, job_id: &str) -> Result<JobRecord, EngineError> {
        self.read(|state| {
            state
                .jobs
                .get(job_id)
                .cloned()
                .ok_or_else(|| EngineError::job_not_found(job_id))
        })
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.read(|state| state.jobs.values().cloned().collect());
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        jobs
    }

    /// Jobs still marked RUNNING; after a restart these are the jobs whose
    /// process died mid-run.
    pub fn running_jobs(&self) -> Vec<JobRecord> {
        self.list()
            .into_iter()
            .filter(|job| job.state == JobState::Running)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use plangate_types::lease::LeaseState;
    use plangate_types::plan::Step;

    use crate::clock::SystemClock;
    use crate::repository::InMemoryStateStore;

    fn two_step_plan(plan_id: &str) -> Plan {
        Plan::new(
            plan_id,
            vec![Step::new("s1", "record"), Step::new("s2", "record")],
        )
    }

    #[test]
    fn start_creates_running_job_at_zero() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let job_id = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();

        let status = jobs.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.checkpoint, 0);
        assert_eq!(status.total_steps, 2);
        assert_eq!(status.owner, "owner");
    }

    #[test]
    fn job_ids_are_unique() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let a = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        let b = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        assert_ne!(a, b);
        assert_eq!(jobs.list().len(), 2);
    }

    #[test]
    fn jobs_sharing_a_plan_id_keep_their_own_steps() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let first = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        let second = jobs
            .start("p1", Plan::new("p1", vec![Step::new("b1", "record")]), "owner")
            .unwrap();

        let steps = |job_id: &str| -> Vec<String> {
            jobs.plan(job_id)
                .unwrap()
                .steps
                .into_iter()
                .map(|s| s.step_id)
                .collect()
        };
        assert_eq!(steps(&first), vec!["s1", "s2"]);
        assert_eq!(steps(&second), vec!["b1"]);
        assert_eq!(jobs.status(&first).unwrap().total_steps, 2);
        jobs.update_checkpoint(&first, 2).unwrap();
    }

    #[test]
    fn start_rejects_mismatched_plan_id() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let err = jobs.start("p1", two_step_plan("p2"), "owner").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn checkpoint_survives_reopen() {
        let store = Arc::new(InMemoryStateStore::new());
        let jobs = JobManager::open(Arc::clone(&store)).unwrap();
        let job_id = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        jobs.update_checkpoint(&job_id, 1).unwrap();
        drop(jobs);

        let reopened = JobManager::open(Arc::clone(&store)).unwrap();
        assert_eq!(reopened.status(&job_id).unwrap().checkpoint, 1);
        assert_eq!(reopened.plan(&job_id).unwrap().len(), 2);
    }

    #[test]
    fn checkpoint_is_monotonic_and_bounded() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let job_id = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();

        jobs.update_checkpoint(&job_id, 2).unwrap();
        assert!(matches!(
            jobs.update_checkpoint(&job_id, 1),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            jobs.update_checkpoint(&job_id, 3),
            Err(EngineError::Validation(_))
        ));
        // Same index again is fine.
        jobs.update_checkpoint(&job_id, 2).unwrap();
        assert_eq!(jobs.status(&job_id).unwrap().checkpoint, 2);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        assert!(matches!(
            jobs.update_checkpoint("missing", 1),
            Err(EngineError::NotFound { entity: "job", .. })
        ));
        assert!(jobs.status("missing").is_err());
        assert!(jobs.stop("missing", JobState::Failed, None).is_err());
    }

    #[test]
    fn failed_flush_rolls_back() {
        let store = Arc::new(InMemoryStateStore::new());
        let jobs = JobManager::open(Arc::clone(&store)).unwrap();
        let job_id = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();

        store.set_fail_saves(true);
        let err = jobs.update_checkpoint(&job_id, 1).unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert_eq!(jobs.status(&job_id).unwrap().checkpoint, 0);
        assert!(jobs.start("p1", two_step_plan("p1"), "owner").is_err());
        assert_eq!(jobs.list().len(), 1);
    }

    #[test]
    fn stop_requires_terminal_state() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let job_id = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        assert!(matches!(
            jobs.stop(&job_id, JobState::Running, None),
            Err(EngineError::Validation(_))
        ));

        jobs.stop(&job_id, JobState::Hung, None).unwrap();
        assert_eq!(jobs.status(&job_id).unwrap().state, JobState::Hung);
        assert!(jobs.running_jobs().is_empty());
    }

    #[test]
    fn stop_with_lease_manager_expires_lease() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let leases = LeaseManager::new(Arc::new(SystemClock));
        let job_id = jobs.start("p2", two_step_plan("p2"), "owner").unwrap();
        leases.attach("lease9", &job_id, "owner", 1_000, 100).unwrap();
        jobs.link_lease(&job_id, Some("lease9")).unwrap();

        jobs.stop(&job_id, JobState::Failed, Some(&leases)).unwrap();

        assert_eq!(leases.get("lease9").unwrap().state, LeaseState::Expired);
        let status = jobs.status(&job_id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.lease_id.is_none());
    }

    #[test]
    fn reopen_restores_running_except_finished() {
        let jobs = JobManager::open(InMemoryStateStore::new()).unwrap();
        let failed = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        let finished = jobs.start("p1", two_step_plan("p1"), "owner").unwrap();
        jobs.stop(&failed, JobState::Failed, None).unwrap();
        jobs.stop(&finished, JobState::Finished, None).unwrap();

        jobs.reopen(&failed).unwrap();
        assert_eq!(jobs.status(&failed).unwrap().state, JobState::Running);
        assert!(jobs.reopen(&finished).is_err());
        assert_eq!(jobs.running_jobs().len(), 1);
    }
}
