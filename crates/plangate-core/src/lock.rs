//! In-memory arbitration of named device resources across jobs.
//!
//! The lock table is a `DashMap` keyed by resource name, so compatibility
//! checks and holder updates for one resource happen under that entry's
//! shard lock. The manager never queues waiters: `acquire` either succeeds
//! immediately or reports contention, and callers poll (the runner does so
//! through its retry policy).

use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use plangate_types::lock::LockMode;

#[derive(Debug, Clone)]
struct LockEntry {
    mode: LockMode,
    holders: HashSet<String>,
}

/// Exclusive/read locks over named resources, keyed by job ID.
#[derive(Debug, Default)]
pub struct ResourceLockManager {
    table: DashMap<String, LockEntry>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take `resource` in `mode` for `job_id`.
    ///
    /// Returns `true` on success, including when `job_id` already holds the
    /// resource (re-entrant acquire is a no-op that keeps the existing mode).
    /// `timeout_ms` is advisory; this call never blocks.
    pub fn acquire(&self, job_id: &str, resource: &str, mode: LockMode, timeout_ms: u64) -> bool {
        let acquired = match self.table.entry(resource.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    mode,
                    holders: HashSet::from([job_id.to_string()]),
                });
                true
            }
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.holders.contains(job_id) {
                    true
                } else if entry.mode.is_compatible_with(mode) {
                    entry.holders.insert(job_id.to_string());
                    true
                } else {
                    false
                }
            }
        };

        tracing::debug!(job_id, resource, %mode, timeout_ms, acquired, "lock acquire");
        acquired
    }

    /// Remove `job_id` from the holders of `resource`.
    ///
    /// Returns `false` if `job_id` was not a holder.
    pub fn release(&self, job_id: &str, resource: &str) -> bool {
        let released = match self.table.get_mut(resource) {
            Some(mut entry) => entry.holders.remove(job_id),
            None => false,
        };
        if released {
            self.table.remove_if(resource, |_, entry| entry.holders.is_empty());
            tracing::debug!(job_id, resource, "lock released");
        }
        released
    }

    /// Release every resource held by `job_id` and return how many there were.
    pub fn release_all(&self, job_id: &str) -> usize {
        let mut released = 0;
        self.table.retain(|_, entry| {
            if entry.holders.remove(job_id) {
                released += 1;
            }
            !entry.holders.is_empty()
        });
        if released > 0 {
            tracing::debug!(job_id, released, "released all locks");
        }
        released
    }

    /// Whether `job_id` currently holds `resource` in any mode.
    pub fn check_owner(&self, job_id: &str, resource: &str) -> bool {
        self.table
            .get(resource)
            .is_some_and(|entry| entry.holders.contains(job_id))
    }

    /// Current mode and holders of `resource`, if anyone holds it.
    pub fn holders(&self, resource: &str) -> Option<(LockMode, Vec<String>)> {
        self.table.get(resource).map(|entry| {
            let mut holders: Vec<String> = entry.holders.iter().cloned().collect();
            holders.sort();
            (entry.mode, holders)
        })
    }

    /// Resources currently held by `job_id`, sorted by name.
    pub fn held_by(&self, job_id: &str) -> Vec<String> {
        let mut resources: Vec<String> = self
            .table
            .iter()
            .filter(|entry| entry.holders.contains(job_id))
            .map(|entry| entry.key().clone())
            .collect();
        resources.sort();
        resources
    }
}
