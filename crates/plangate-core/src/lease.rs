//! Controller leases over running jobs.
//!
//! A lease binds one controller (`owner`) to one job for a TTL window that
//! heartbeats extend. At most one lease per job is *live* (ATTACHED and not
//! past expiry) at any instant; the `by_job` index always points at the most
//! recent lease attached for each job.
//!
//! Expiry is evaluated lazily against the injected clock: a lease whose
//! deadline has passed is marked EXPIRED the next time anyone looks at it.
//! Once EXPIRED, heartbeats cannot revive it.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use plangate_types::config::LeaseConfig;
use plangate_types::error::EngineError;
use plangate_types::lease::{Lease, LeaseState};

use crate::clock::SharedClock;

#[derive(Debug, Default)]
struct LeaseTable {
    leases: HashMap<String, Lease>,
    by_job: HashMap<String, String>,
}

impl LeaseTable {
    /// Mark `lease_id` EXPIRED if it is ATTACHED and past its deadline.
    fn expire_if_due(&mut self, lease_id: &str, now: DateTime<Utc>) -> Option<&Lease> {
        let lease = self.leases.get_mut(lease_id)?;
        if lease.state == LeaseState::Attached && lease.is_past_expiry(now) {
            lease.state = LeaseState::Expired;
            tracing::info!(lease_id, job_id = %lease.job_id, "lease expired");
        }
        Some(&*lease)
    }

    /// The live lease for `job_id`, if any, after applying lazy expiry.
    fn live_lease_for_job(&mut self, job_id: &str, now: DateTime<Utc>) -> Option<Lease> {
        let lease_id = self.by_job.get(job_id)?.clone();
        self.expire_if_due(&lease_id, now)
            .filter(|lease| lease.is_live_at(now))
            .cloned()
    }
}

/// Issues and tracks controller leases.
#[derive(Debug)]
pub struct LeaseManager {
    clock: SharedClock,
    config: LeaseConfig,
    table: Mutex<LeaseTable>,
}

impl LeaseManager {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_config(clock, LeaseConfig::default())
    }

    pub fn with_config(clock: SharedClock, config: LeaseConfig) -> Self {
        Self {
            clock,
            config,
            table: Mutex::new(LeaseTable::default()),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn deadline(now: DateTime<Utc>, ttl_ms: u64) -> DateTime<Utc> {
        now + Duration::milliseconds(i64::try_from(ttl_ms).unwrap_or(i64::MAX / 2))
    }

    /// Attach a controller to a job.
    ///
    /// Attaching again with the same `lease_id` and `owner` while the lease is
    /// live refreshes it. Any other attach while a live lease exists for the
    /// job is rejected with `Validation`.
    pub fn attach(
        &self,
        lease_id: &str,
        job_id: &str,
        owner: &str,
        ttl_ms: u64,
        heartbeat_interval_ms: u64,
    ) -> Result<Lease, EngineError> {
        if ttl_ms == 0 {
            return Err(EngineError::Validation(
                "lease ttl_ms must be positive".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");

        if let Some(live) = table.live_lease_for_job(job_id, now) {
            if live.lease_id != lease_id || live.owner != owner {
                return Err(EngineError::Validation(format!(
                    "job {job_id} already has live lease {} held by {}",
                    live.lease_id, live.owner
                )));
            }
        }

        if let Some(existing) = table.leases.get(lease_id) {
            if existing.job_id != job_id {
                return Err(EngineError::Validation(format!(
                    "lease {lease_id} belongs to job {}",
                    existing.job_id
                )));
            }
            if existing.invalidated {
                return Err(EngineError::Validation(format!(
                    "lease {lease_id} was invalidated when its job stopped"
                )));
            }
        }

        let lease = Lease {
            lease_id: lease_id.to_string(),
            job_id: job_id.to_string(),
            owner: owner.to_string(),
            state: LeaseState::Attached,
            ttl_ms,
            heartbeat_interval_ms,
            attached_at: now,
            lease_expiry_ts: Self::deadline(now, ttl_ms),
            invalidated: false,
        };
        table.leases.insert(lease_id.to_string(), lease.clone());
        table
            .by_job
            .insert(job_id.to_string(), lease_id.to_string());

        tracing::info!(job_id, lease_id, owner, ttl_ms, "lease attached");
        Ok(lease)
    }

    /// Attach using the configured default TTL and heartbeat interval.
    pub fn attach_default(
        &self,
        lease_id: &str,
        job_id: &str,
        owner: &str,
    ) -> Result<Lease, EngineError> {
        self.attach(
            lease_id,
            job_id,
            owner,
            self.config.default_ttl_ms,
            self.config.heartbeat_interval_ms,
        )
    }

    /// Extend an ATTACHED lease by its TTL.
    ///
    /// Returns `false` without side effects when the lease is DETACHED or
    /// EXPIRED, and marks it EXPIRED (returning `false`) when the heartbeat
    /// arrives after the deadline.
    pub fn heartbeat(&self, lease_id: &str) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");
        let lease = table
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| EngineError::lease_not_found(lease_id))?;

        if lease.state != LeaseState::Attached {
            return Ok(false);
        }
        if lease.is_past_expiry(now) {
            lease.state = LeaseState::Expired;
            tracing::info!(lease_id, job_id = %lease.job_id, "late heartbeat, lease expired");
            return Ok(false);
        }
        lease.lease_expiry_ts = Self::deadline(now, lease.ttl_ms);
        tracing::trace!(lease_id, "lease heartbeat");
        Ok(true)
    }

    /// Whether the lease is EXPIRED, transitioning it first if it is overdue.
    ///
    /// DETACHED leases never expire.
    pub fn check_expired(&self, lease_id: &str) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");
        let lease = table
            .expire_if_due(lease_id, now)
            .ok_or_else(|| EngineError::lease_not_found(lease_id))?;
        Ok(lease.state == LeaseState::Expired)
    }

    /// Release the controller without affecting the job.
    ///
    /// Only the ATTACHED -> DETACHED transition returns `true`; repeating the
    /// call, or detaching an expired lease, is a no-op returning `false`.
    pub fn detach(&self, lease_id: &str) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");
        let lease = table
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| EngineError::lease_not_found(lease_id))?;

        match lease.state {
            LeaseState::Detached | LeaseState::Expired => Ok(false),
            LeaseState::Attached if lease.is_past_expiry(now) => {
                lease.state = LeaseState::Expired;
                Ok(false)
            }
            LeaseState::Attached => {
                lease.state = LeaseState::Detached;
                tracing::info!(lease_id, job_id = %lease.job_id, "lease detached");
                Ok(true)
            }
        }
    }

    /// Re-establish a lease on the same job with a fresh TTL window.
    ///
    /// Allowed from DETACHED. Allowed from EXPIRED only when
    /// `allow_reattach_from_expired` is set and the lease was not invalidated
    /// by its job stopping.
    pub fn reattach(
        &self,
        lease_id: &str,
        job_id: &str,
        owner: &str,
        ttl_ms: u64,
        heartbeat_interval_ms: u64,
    ) -> Result<Lease, EngineError> {
        if ttl_ms == 0 {
            return Err(EngineError::Validation(
                "lease ttl_ms must be positive".to_string(),
            ));
        }
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");

        let current = table
            .expire_if_due(lease_id, now)
            .cloned()
            .ok_or_else(|| EngineError::lease_not_found(lease_id))?;

        if current.job_id != job_id {
            return Err(EngineError::Validation(format!(
                "lease {lease_id} belongs to job {}, not {job_id}",
                current.job_id
            )));
        }
        if current.invalidated {
            return Err(EngineError::Validation(format!(
                "lease {lease_id} was invalidated when its job stopped"
            )));
        }
        match current.state {
            LeaseState::Detached => {}
            LeaseState::Expired if self.config.allow_reattach_from_expired => {}
            LeaseState::Expired => {
                return Err(EngineError::Validation(format!(
                    "lease {lease_id} has expired"
                )));
            }
            LeaseState::Attached => {
                return Err(EngineError::Validation(format!(
                    "lease {lease_id} is already attached"
                )));
            }
        }
        if let Some(live) = table.live_lease_for_job(job_id, now) {
            return Err(EngineError::Validation(format!(
                "job {job_id} already has live lease {}",
                live.lease_id
            )));
        }

        let lease = table
            .leases
            .get_mut(lease_id)
            .ok_or_else(|| EngineError::lease_not_found(lease_id))?;
        lease.state = LeaseState::Attached;
        lease.owner = owner.to_string();
        lease.ttl_ms = ttl_ms;
        lease.heartbeat_interval_ms = heartbeat_interval_ms;
        lease.attached_at = now;
        lease.lease_expiry_ts = Self::deadline(now, ttl_ms);
        let lease = lease.clone();
        table
            .by_job
            .insert(job_id.to_string(), lease_id.to_string());

        tracing::info!(job_id, lease_id, owner, "lease reattached");
        Ok(lease)
    }

    /// Force every lease on `job_id` to EXPIRED and mark it non-reattachable.
    ///
    /// Called when the job stops. Returns how many leases were touched.
    pub fn invalidate_job(&self, job_id: &str) -> usize {
        let mut table = self.table.lock().expect("lease table lock poisoned");
        let mut touched = 0;
        for lease in table.leases.values_mut().filter(|l| l.job_id == job_id) {
            lease.state = LeaseState::Expired;
            lease.invalidated = true;
            touched += 1;
        }
        if touched > 0 {
            tracing::info!(job_id, leases = touched, "leases invalidated on job stop");
        }
        touched
    }

    /// Snapshot of a lease, with lazy expiry applied.
    pub fn get(&self, lease_id: &str) -> Option<Lease> {
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");
        table.expire_if_due(lease_id, now).cloned()
    }

    /// Most recent lease attached to `job_id`, with lazy expiry applied.
    pub fn lease_for_job(&self, job_id: &str) -> Option<Lease> {
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");
        let lease_id = table.by_job.get(job_id)?.clone();
        table.expire_if_due(&lease_id, now).cloned()
    }

    /// All leases, sorted by attach time.
    pub fn list(&self) -> Vec<Lease> {
        let now = self.clock.now();
        let mut table = self.table.lock().expect("lease table lock poisoned");
        let ids: Vec<String> = table.leases.keys().cloned().collect();
        let mut leases: Vec<Lease> = ids
            .iter()
            .filter_map(|id| table.expire_if_due(id, now).cloned())
            .collect();
        leases.sort_by(|a, b| a.attached_at.cmp(&b.attached_at));
        leases
    }
}
