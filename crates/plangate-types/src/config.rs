//! Engine configuration types.
//!
//! `EngineConfig` represents `plangate.toml`, which controls where job state
//! and logs live, default run guards, watchdog budgets and lease defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Durable job state file. Relative paths resolve against the data dir.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Directory for per-job log files. Relative paths resolve against the data dir.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Size at which a job log file is rotated.
    #[serde(default = "default_log_max_bytes")]
    pub log_max_bytes: u64,

    /// Declare a job HUNG after this long without a completed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_timeout_ms: Option<u64>,

    /// Advisory lock acquisition bound passed to the lock manager.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Capacity of the telemetry broadcast channel.
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,

    #[serde(default)]
    pub budgets: BudgetConfig,

    #[serde(default)]
    pub leases: LeaseConfig,
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_max_bytes() -> u64 {
    1_048_576
}

fn default_lock_timeout_ms() -> u64 {
    1_000
}

fn default_telemetry_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            log_dir: default_log_dir(),
            log_max_bytes: default_log_max_bytes(),
            progress_timeout_ms: None,
            lock_timeout_ms: default_lock_timeout_ms(),
            telemetry_capacity: default_telemetry_capacity(),
            budgets: BudgetConfig::default(),
            leases: LeaseConfig::default(),
        }
    }
}

/// Engine-wide watchdog limits. `None` means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Lease defaults and reattach policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Allow `reattach` on a lease that expired by TTL (not by job stop).
    #[serde(default)]
    pub allow_reattach_from_expired: bool,
}

fn default_ttl_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_ttl_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            allow_reattach_from_expired: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.state_path, PathBuf::from("state.json"));
        assert_eq!(config.log_max_bytes, 1_048_576);
        assert_eq!(config.lock_timeout_ms, 1_000);
        assert!(config.progress_timeout_ms.is_none());
        assert_eq!(config.leases.default_ttl_ms, 30_000);
        assert!(!config.leases.allow_reattach_from_expired);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
state_path = "/var/lib/plangate/jobs.json"
log_max_bytes = 4096
progress_timeout_ms = 30000

[budgets]
max_steps = 50
max_retries = 10

[leases]
default_ttl_ms = 10000
allow_reattach_from_expired = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.state_path, PathBuf::from("/var/lib/plangate/jobs.json"));
        assert_eq!(config.log_max_bytes, 4096);
        assert_eq!(config.progress_timeout_ms, Some(30_000));
        assert_eq!(config.budgets.max_steps, Some(50));
        assert_eq!(config.budgets.max_total_ms, None);
        assert_eq!(config.leases.default_ttl_ms, 10_000);
        assert_eq!(config.leases.heartbeat_interval_ms, 5_000);
        assert!(config.leases.allow_reattach_from_expired);
    }
}
