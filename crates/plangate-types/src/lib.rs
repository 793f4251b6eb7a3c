//! Shared domain types for plangate.
//!
//! This crate contains the types passed between the engine components:
//! plans and steps, job records, leases, lock modes, telemetry/log records,
//! engine configuration, and the error taxonomy.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod job;
pub mod lease;
pub mod lock;
pub mod plan;
pub mod telemetry;
