//! # Backoff Calculator
//!
//! Computes how long a failed, retry-eligible step must wait before its next
//! attempt.
//!
//! - **Server-requested backoff**: a failure that carried `retry_after` wins,
//!   capped at the configured maximum, without jitter.
//! - **Exponential backoff**: `base * multiplier^(attempts - 1)`, capped at
//!   the maximum.
//! - **Jitter**: optional, symmetric, at most `max_jitter` of the delay, and
//!   seeded from `(step_uuid, attempts)` so every readiness pass computes the
//!   same `next_retry_at` for the same failure.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BackoffConfig;

/// Configuration for backoff calculation behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffCalculatorConfig {
    pub base_delay_seconds: u64,
    pub max_delay_seconds: u64,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    /// Maximum jitter as a fraction of the delay (0.0 to 1.0)
    pub max_jitter: f64,
}

impl Default for BackoffCalculatorConfig {
    fn default() -> Self {
        Self::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffCalculatorConfig {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay_seconds: config.base_backoff_seconds,
            max_delay_seconds: config.max_backoff_seconds,
            multiplier: config.backoff_multiplier,
            jitter_enabled: config.jitter_enabled,
            max_jitter: config.jitter_max_percentage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    ServerRequested,
    Exponential,
}

/// Result of a backoff calculation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffResult {
    pub delay: Duration,
    pub backoff_type: BackoffType,
}

#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    config: BackoffCalculatorConfig,
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new(BackoffCalculatorConfig::default())
    }
}

impl BackoffCalculator {
    pub fn new(config: BackoffCalculatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BackoffCalculatorConfig {
        &self.config
    }

    /// Delay owed after the `attempts`-th failed attempt
    pub fn calculate(
        &self,
        step_uuid: Uuid,
        attempts: i32,
        backoff_request_seconds: Option<i32>,
    ) -> BackoffResult {
        let max_delay = self.config.max_delay_seconds as f64;

        if let Some(requested) = backoff_request_seconds {
            let seconds = f64::from(requested.max(0)).min(max_delay);
            return BackoffResult {
                delay: seconds_to_duration(seconds),
                backoff_type: BackoffType::ServerRequested,
            };
        }

        let exponent = attempts.saturating_sub(1).max(0);
        let base = self.config.base_delay_seconds as f64;
        let mut seconds = (base * self.config.multiplier.powi(exponent)).min(max_delay);

        if self.config.jitter_enabled && self.config.max_jitter > 0.0 {
            let mut rng = fastrand::Rng::with_seed(jitter_seed(step_uuid, attempts));
            let factor = (rng.f64() * 2.0 - 1.0) * self.config.max_jitter;
            seconds = (seconds * (1.0 + factor)).clamp(0.0, max_delay);
        }

        BackoffResult {
            delay: seconds_to_duration(seconds),
            backoff_type: BackoffType::Exponential,
        }
    }

    /// Earliest retry instant for a step whose last failure was at
    /// `last_failure_at`; `now` when it has never failed
    pub fn next_retry_at(
        &self,
        step_uuid: Uuid,
        attempts: i32,
        backoff_request_seconds: Option<i32>,
        last_failure_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match last_failure_at {
            Some(failed_at) => {
                failed_at + self.calculate(step_uuid, attempts, backoff_request_seconds).delay
            }
            None => now,
        }
    }
}

fn jitter_seed(step_uuid: Uuid, attempts: i32) -> u64 {
    let bits = step_uuid.as_u128();
    (bits as u64) ^ ((bits >> 64) as u64) ^ u64::from(attempts.unsigned_abs())
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::milliseconds((seconds * 1000.0).round() as i64)
}
