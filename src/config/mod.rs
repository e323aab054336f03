//! # Engine Configuration
//!
//! Typed configuration tree for the orchestration core. Values come from
//! compiled defaults, optional YAML files and `TASKER__`-prefixed environment
//! variables, merged by [`ConfigManager`] and validated once at load time.
//! Components built from a validated [`TaskerConfig`] never re-check bounds
//! at call time.
//!
//! ```rust,no_run
//! use tasker_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let limit = manager.config().execution.max_concurrent_steps_limit;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/tasker.yaml`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct TaskerConfig {
    pub execution: ExecutionConfig,
    pub backoff: BackoffConfig,
    pub dependency_graph: DependencyGraphConfig,
    pub health: HealthConfig,
    pub events: EventsConfig,
    pub system: SystemConfig,
}

/// Step and task execution bounds
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub min_concurrent_steps: usize,
    pub max_concurrent_steps_limit: usize,
    pub concurrency_cache_duration_seconds: u64,
    pub batch_timeout_base_seconds: u64,
    pub batch_timeout_per_step_seconds: u64,
    pub max_batch_timeout_seconds: u64,
    /// Upper bound on readiness passes per coordinator run
    pub max_orchestration_passes: u32,
    /// Longest backoff the coordinator will sleep through in-session; 0 disables
    pub max_in_session_wait_seconds: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            min_concurrent_steps: 3,
            max_concurrent_steps_limit: 12,
            concurrency_cache_duration_seconds: 30,
            batch_timeout_base_seconds: 30,
            batch_timeout_per_step_seconds: 5,
            max_batch_timeout_seconds: 120,
            max_orchestration_passes: 1000,
            max_in_session_wait_seconds: 0,
            max_concurrent_tasks: 10,
        }
    }
}

impl ExecutionConfig {
    pub fn concurrency_cache_duration(&self) -> Duration {
        Duration::from_secs(self.concurrency_cache_duration_seconds)
    }

    pub fn batch_timeout_base(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_base_seconds)
    }

    pub fn batch_timeout_per_step(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_per_step_seconds)
    }

    pub fn max_batch_timeout(&self) -> Duration {
        Duration::from_secs(self.max_batch_timeout_seconds)
    }

    pub fn max_in_session_wait(&self) -> Duration {
        Duration::from_secs(self.max_in_session_wait_seconds)
    }

    /// Reject inconsistent concurrency and batch bounds
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.min_concurrent_steps == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.min_concurrent_steps",
                0,
                "must be greater than 0",
            ));
        }
        if self.max_concurrent_steps_limit == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_steps_limit",
                0,
                "must be greater than 0",
            ));
        }
        if self.min_concurrent_steps > self.max_concurrent_steps_limit {
            return Err(ConfigurationError::invalid_value(
                "execution.min_concurrent_steps",
                self.min_concurrent_steps,
                format!(
                    "must not exceed max_concurrent_steps_limit ({})",
                    self.max_concurrent_steps_limit
                ),
            ));
        }
        if self.max_batch_timeout_seconds <= self.batch_timeout_base_seconds {
            return Err(ConfigurationError::invalid_value(
                "execution.max_batch_timeout_seconds",
                self.max_batch_timeout_seconds,
                format!(
                    "must be greater than batch_timeout_base_seconds ({})",
                    self.batch_timeout_base_seconds
                ),
            ));
        }
        if self.max_orchestration_passes == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_orchestration_passes",
                0,
                "must be greater than 0",
            ));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigurationError::invalid_value(
                "execution.max_concurrent_tasks",
                0,
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

/// Backoff and retry configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub backoff_multiplier: f64,
    pub jitter_enabled: bool,
    pub jitter_max_percentage: f64,
    pub reenqueue_delays: ReenqueueDelays,
    pub default_reenqueue_delay: u64,
    pub buffer_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_backoff_seconds: 1,
            max_backoff_seconds: 300,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_max_percentage: 0.1,
            reenqueue_delays: ReenqueueDelays::default(),
            default_reenqueue_delay: 30,
            buffer_seconds: 5,
        }
    }
}

/// Per-status delays, in seconds, for asynchronous re-enqueue
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReenqueueDelays {
    pub has_ready_steps: u64,
    pub waiting_for_dependencies: u64,
    pub processing: u64,
}

impl Default for ReenqueueDelays {
    fn default() -> Self {
        Self {
            has_ready_steps: 0,
            waiting_for_dependencies: 45,
            processing: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DependencyGraphConfig {
    pub max_depth: usize,
}

impl Default for DependencyGraphConfig {
    fn default() -> Self {
        Self {
            max_depth: crate::constants::system::MAX_DEPENDENCY_DEPTH,
        }
    }
}

/// Task health classification
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Share of permanently failed steps at which a task reports `blocked`
    pub blocked_failure_ratio: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            blocked_failure_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemConfig {
    pub default_retry_limit: i32,
    pub max_workflow_steps: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            default_retry_limit: crate::constants::system::DEFAULT_RETRY_LIMIT,
            max_workflow_steps: crate::constants::system::MAX_WORKFLOW_STEPS,
        }
    }
}

impl TaskerConfig {
    /// Short timeouts, deterministic backoff, and in-session waits for
    /// short backoffs
    pub fn for_testing() -> Self {
        Self {
            execution: ExecutionConfig {
                batch_timeout_base_seconds: 5,
                batch_timeout_per_step_seconds: 1,
                max_batch_timeout_seconds: 10,
                max_orchestration_passes: 50,
                max_in_session_wait_seconds: 3,
                ..ExecutionConfig::default()
            },
            backoff: BackoffConfig {
                base_backoff_seconds: 1,
                max_backoff_seconds: 2,
                jitter_enabled: false,
                jitter_max_percentage: 0.0,
                ..BackoffConfig::default()
            },
            ..Self::default()
        }
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.execution.validate()?;

        let backoff = &self.backoff;
        if backoff.base_backoff_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.base_backoff_seconds",
                0,
                "must be greater than 0",
            ));
        }
        if backoff.max_backoff_seconds < backoff.base_backoff_seconds {
            return Err(ConfigurationError::invalid_value(
                "backoff.max_backoff_seconds",
                backoff.max_backoff_seconds,
                format!(
                    "must be at least base_backoff_seconds ({})",
                    backoff.base_backoff_seconds
                ),
            ));
        }
        if !(backoff.backoff_multiplier >= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "backoff.backoff_multiplier",
                backoff.backoff_multiplier,
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&backoff.jitter_max_percentage) {
            return Err(ConfigurationError::invalid_value(
                "backoff.jitter_max_percentage",
                backoff.jitter_max_percentage,
                "must be between 0.0 and 1.0",
            ));
        }

        if self.dependency_graph.max_depth == 0 {
            return Err(ConfigurationError::invalid_value(
                "dependency_graph.max_depth",
                0,
                "must be greater than 0",
            ));
        }

        let ratio = self.health.blocked_failure_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "health.blocked_failure_ratio",
                ratio,
                "must be in (0.0, 1.0]",
            ));
        }

        if self.system.default_retry_limit < 0 {
            return Err(ConfigurationError::invalid_value(
                "system.default_retry_limit",
                self.system.default_retry_limit,
                "must not be negative",
            ));
        }

        Ok(())
    }
}
