//! Lease records: TTL-bound ownership of a job by a remote controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lease lifecycle state.
///
/// ```text
/// (none) --attach--> ATTACHED
/// ATTACHED --heartbeat--> ATTACHED (extended expiry)
/// ATTACHED --detach--> DETACHED --reattach--> ATTACHED
/// ATTACHED --ttl elapsed / invalidate--> EXPIRED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    Attached,
    Detached,
    Expired,
}

impl std::fmt::Display for LeaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseState::Attached => write!(f, "ATTACHED"),
            LeaseState::Detached => write!(f, "DETACHED"),
            LeaseState::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// A lease binding an owner to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub job_id: String,
    pub owner: String,
    pub state: LeaseState,
    pub ttl_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub attached_at: DateTime<Utc>,
    pub lease_expiry_ts: DateTime<Utc>,
    /// Set when the lease was forced to EXPIRED because its job stopped.
    #[serde(default)]
    pub invalidated: bool,
}

impl Lease {
    /// Whether the TTL has elapsed at `now` (strictly after the expiry instant).
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now > self.lease_expiry_ts
    }

    /// ATTACHED and not past expiry at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.state == LeaseState::Attached && !self.is_past_expiry(now)
    }
}
