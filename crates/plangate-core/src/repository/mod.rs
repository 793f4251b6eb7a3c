//! Storage port definitions.
//!
//! The infrastructure layer (plangate-infra) implements these traits on top
//! of the filesystem. The core crate never depends on a specific storage
//! technology; tests use the in-memory implementation defined here.

pub mod job;

pub use job::{InMemoryStateStore, JobStateStore, StateSnapshot, STATE_FORMAT_VERSION};
