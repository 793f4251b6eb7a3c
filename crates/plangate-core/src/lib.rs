//! Plan execution engine for plangate.
//!
//! This crate holds the orchestration logic -- durable jobs, the step
//! runner, guards, resource locks, the watchdog and leases -- and defines the
//! storage port (`JobStateStore`) that the infrastructure layer implements.
//! It depends only on `plangate-types`, never on `plangate-infra`.

pub mod action;
pub mod clock;
pub mod context;
pub mod definition;
pub mod guard;
pub mod job;
pub mod lease;
pub mod lock;
pub mod logging;
pub mod repository;
pub mod retry;
pub mod runner;
pub mod telemetry;
pub mod watchdog;
