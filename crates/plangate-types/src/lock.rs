//! Resource lock modes.

use serde::{Deserialize, Serialize};

/// How a job holds a named resource.
///
/// `Exclusive` is incompatible with every other holder; `Read` is compatible
/// with other `Read` holders only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    Exclusive,
    Read,
}

impl LockMode {
    /// Whether a new request in `requested` mode can join holders in `self` mode.
    pub fn is_compatible_with(self, requested: LockMode) -> bool {
        matches!((self, requested), (LockMode::Read, LockMode::Read))
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Exclusive => write!(f, "exclusive"),
            LockMode::Read => write!(f, "read"),
        }
    }
}
