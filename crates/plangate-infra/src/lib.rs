//! Infrastructure layer for plangate.
//!
//! Filesystem implementations of the ports defined in `plangate-core`: the
//! JSON job state file, rotating per-job log files, TOML configuration
//! loading, and the [`engine::Engine`] assembly that wires them together.

pub mod config;
pub mod engine;
pub mod file_logger;
pub mod state_file;
