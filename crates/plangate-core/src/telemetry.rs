//! Append-only telemetry with live fan-out.
//!
//! Every record is kept in order (sequence numbers start at 1) and also
//! broadcast on a `tokio::sync::broadcast` channel. Broadcasting with no
//! subscribers is a no-op; slow subscribers may lag, but the stored list
//! never drops records.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;

use plangate_types::telemetry::{EventKind, TelemetryRecord};

use crate::clock::SharedClock;

/// Default broadcast channel capacity.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1024;

/// In-memory telemetry sink shared by runners.
pub struct TelemetryStore {
    clock: SharedClock,
    records: Mutex<Vec<TelemetryRecord>>,
    sender: broadcast::Sender<TelemetryRecord>,
}

impl TelemetryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, DEFAULT_TELEMETRY_CAPACITY)
    }

    pub fn with_capacity(clock: SharedClock, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            clock,
            records: Mutex::new(Vec::new()),
            sender,
        }
    }

    /// Append a record and broadcast it.
    pub fn record(
        &self,
        job_id: &str,
        step_id: Option<&str>,
        kind: EventKind,
        payload: Value,
    ) -> TelemetryRecord {
        let record = {
            let mut records = self.records.lock().expect("telemetry lock poisoned");
            let record = TelemetryRecord {
                seq: records.len() as u64 + 1,
                timestamp: self.clock.now(),
                job_id: job_id.to_string(),
                step_id: step_id.map(str::to_string),
                kind,
                payload,
            };
            records.push(record.clone());
            record
        };
        let _ = self.sender.send(record.clone());
        record
    }

    /// Receive every record appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.sender.subscribe()
    }

    /// All records, in append order.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records.lock().expect("telemetry lock poisoned").clone()
    }

    /// Records for one job, in append order.
    pub fn records_for(&self, job_id: &str) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .expect("telemetry lock poisoned")
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Event kinds recorded for one job, in order.
    pub fn kinds_for(&self, job_id: &str) -> Vec<EventKind> {
        self.records_for(job_id).into_iter().map(|r| r.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("telemetry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore")
            .field("records", &self.len())
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
