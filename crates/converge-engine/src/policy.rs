//! Execution policy and lifecycle directives

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use converge_core::ReconcileConfig;

/// Timing budget for async jobs and the post-delete existence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub poll_interval: Duration,
    pub poll_backoff_max: Duration,
    pub operation_timeout: Duration,
    pub delete_confirm_attempts: u32,
    pub delete_confirm_backoff: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self::from(&ReconcileConfig::default())
    }
}

impl From<&ReconcileConfig> for ReconcilePolicy {
    fn from(cfg: &ReconcileConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            poll_backoff_max: cfg.poll_backoff_max().max(cfg.poll_interval()),
            operation_timeout: cfg.operation_timeout(),
            delete_confirm_attempts: cfg.delete_confirm_attempts.max(1),
            delete_confirm_backoff: cfg.delete_confirm_backoff(),
        }
    }
}

/// Caller restrictions on what a reconciliation may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Fail instead of creating a missing resource
    BlockCreation,
    /// Fail if the resource already exists
    BlockAcquire,
    /// Fail instead of updating in place
    BlockModification,
    /// Fail instead of deleting, including as part of a recreate
    BlockDestruction,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::BlockCreation => write!(f, "block_creation"),
            Lifecycle::BlockAcquire => write!(f, "block_acquire"),
            Lifecycle::BlockModification => write!(f, "block_modification"),
            Lifecycle::BlockDestruction => write!(f, "block_destruction"),
        }
    }
}

pub type LifecycleSet = BTreeSet<Lifecycle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_config() {
        let cfg = ReconcileConfig {
            poll_interval_ms: 200,
            poll_backoff_max_ms: 100,
            operation_timeout_secs: 60,
            delete_confirm_attempts: 0,
            delete_confirm_backoff_ms: 250,
        };
        let policy = ReconcilePolicy::from(&cfg);
        assert_eq!(policy.poll_interval, Duration::from_millis(200));
        // the cap never undercuts the first interval
        assert_eq!(policy.poll_backoff_max, Duration::from_millis(200));
        assert_eq!(policy.delete_confirm_attempts, 1);
        assert_eq!(policy.operation_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_lifecycle_serde() {
        let l: Lifecycle = serde_json::from_str("\"block_destruction\"").unwrap();
        assert_eq!(l, Lifecycle::BlockDestruction);
        assert_eq!(l.to_string(), "block_destruction");
    }
}
