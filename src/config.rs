//! Engine configuration.
//!
//! Everything has a default; `from_env` overrides individual fields from
//! `EDIT_PLAN_*` variables and ignores unset or unparsable values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::RetryPolicy;
use crate::policy::PlannerConfig;
use crate::progress::DEFAULT_CHANNEL_CAPACITY;

/// Configuration for the job state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Solver parameters.
    pub planner: PlannerConfig,
    /// Retry policy for external stages.
    pub retry: RetryPolicy,
    /// Heartbeat age after which a claimed stage counts as interrupted.
    pub staleness_secs: u64,
    /// Interval between heartbeats of a running stage.
    pub heartbeat_interval_secs: u64,
    /// Resume interrupted jobs on recovery instead of failing them.
    pub auto_resume: bool,
    /// Per-job progress broadcast buffer.
    pub progress_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            planner: PlannerConfig::default(),
            retry: RetryPolicy::default(),
            staleness_secs: 60,
            heartbeat_interval_secs: 10,
            auto_resume: true,
            progress_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `EDIT_PLAN_MIN_SPEED` / `EDIT_PLAN_MAX_SPEED` | 0.5 / 2.0 |
    /// | `EDIT_PLAN_MIN_FILL` | 0.5 |
    /// | `EDIT_PLAN_SNAP_TOLERANCE` | 0.25 |
    /// | `EDIT_PLAN_STABILITY_THRESHOLD` | 0.5 |
    /// | `EDIT_PLAN_ALLOW_RESIDUAL_GAPS` | true |
    /// | `EDIT_PLAN_ALLOW_REUSE` | true |
    /// | `EDIT_PLAN_EDGE_GAPS` | planner default |
    /// | `EDIT_PLAN_MAX_ATTEMPTS` | 3 |
    /// | `EDIT_PLAN_BACKOFF_MS` | 1000 |
    /// | `EDIT_PLAN_STAGE_TIMEOUT_MS` | unset |
    /// | `EDIT_PLAN_STALENESS_SECS` | 60 |
    /// | `EDIT_PLAN_HEARTBEAT_SECS` | 10 |
    /// | `EDIT_PLAN_AUTO_RESUME` | true |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let planner = PlannerConfig {
            min_speed: env_or("EDIT_PLAN_MIN_SPEED", defaults.planner.min_speed),
            max_speed: env_or("EDIT_PLAN_MAX_SPEED", defaults.planner.max_speed),
            min_fill: env_or("EDIT_PLAN_MIN_FILL", defaults.planner.min_fill),
            snap_tolerance: env_or("EDIT_PLAN_SNAP_TOLERANCE", defaults.planner.snap_tolerance),
            stability_threshold: env_or(
                "EDIT_PLAN_STABILITY_THRESHOLD",
                defaults.planner.stability_threshold,
            ),
            allow_residual_gaps: env_or(
                "EDIT_PLAN_ALLOW_RESIDUAL_GAPS",
                defaults.planner.allow_residual_gaps,
            ),
            allow_reuse: env_or("EDIT_PLAN_ALLOW_REUSE", defaults.planner.allow_reuse),
            edge_gaps: env_or("EDIT_PLAN_EDGE_GAPS", defaults.planner.edge_gaps),
            ..defaults.planner
        };
        let retry = RetryPolicy {
            max_attempts: env_or("EDIT_PLAN_MAX_ATTEMPTS", defaults.retry.max_attempts),
            initial_backoff_ms: env_or("EDIT_PLAN_BACKOFF_MS", defaults.retry.initial_backoff_ms),
            stage_timeout_ms: std::env::var("EDIT_PLAN_STAGE_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok()),
            ..defaults.retry
        };

        Self {
            planner,
            retry,
            staleness_secs: env_or("EDIT_PLAN_STALENESS_SECS", defaults.staleness_secs),
            heartbeat_interval_secs: env_or(
                "EDIT_PLAN_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            ),
            auto_resume: env_or("EDIT_PLAN_AUTO_RESUME", defaults.auto_resume),
            progress_capacity: env_or("EDIT_PLAN_PROGRESS_CAPACITY", defaults.progress_capacity),
        }
    }

    /// Staleness threshold as a chrono duration.
    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs.min(i64::MAX as u64) as i64)
    }

    /// Heartbeat interval; never zero.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}
