//! # Concurrency Governor
//!
//! Recommends how many steps a batch may run in parallel, given resource
//! pressure, and how long the batch may take.
//!
//! The recommendation starts at the configured maximum and scales down in
//! pressure bands:
//!
//! | pool utilization | factor |
//! |---|---|
//! | < 50% | 1.0 |
//! | < 70% | 0.75 |
//! | < 85% | 0.5 |
//! | otherwise | floor at minimum |
//!
//! It is then capped by the connections still available and clamped to
//! `[min, max]`. The value is cached process-wide for the configured
//! duration; readers copy it out of an [`AtomicCell`].

use std::time::{Duration, Instant};

use crossbeam::atomic::AtomicCell;
use tracing::debug;

use crate::config::{ConfigResult, ExecutionConfig};

/// Resource-pressure inputs sampled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PressureSignals {
    /// Fraction of the connection pool in use, `0.0..=1.0`
    pub pool_utilization: f64,
    /// Connections still free, when the caller knows it
    pub available_connections: Option<usize>,
}

impl PressureSignals {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn with_utilization(pool_utilization: f64) -> Self {
        Self {
            pool_utilization,
            available_connections: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CachedConcurrency {
    value: usize,
    computed_at: Instant,
}

#[derive(Debug)]
pub struct ConcurrencyGovernor {
    min_concurrent_steps: usize,
    max_concurrent_steps: usize,
    cache_duration: Duration,
    batch_timeout_base: Duration,
    batch_timeout_per_step: Duration,
    max_batch_timeout: Duration,
    cached: AtomicCell<Option<CachedConcurrency>>,
}

impl ConcurrencyGovernor {
    /// Build from an execution config, rejecting inconsistent bounds
    pub fn new(config: &ExecutionConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            min_concurrent_steps: config.min_concurrent_steps,
            max_concurrent_steps: config.max_concurrent_steps_limit,
            cache_duration: config.concurrency_cache_duration(),
            batch_timeout_base: config.batch_timeout_base(),
            batch_timeout_per_step: config.batch_timeout_per_step(),
            max_batch_timeout: config.max_batch_timeout(),
            cached: AtomicCell::new(None),
        })
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min_concurrent_steps, self.max_concurrent_steps)
    }

    /// Cached recommendation, recomputed from `signals` once the cache expires
    pub fn recommended_concurrency(&self, signals: PressureSignals) -> usize {
        if let Some(cached) = self.cached.load() {
            if cached.computed_at.elapsed() < self.cache_duration {
                return cached.value;
            }
        }

        let value = self.compute_concurrency(signals);
        self.cached.store(Some(CachedConcurrency {
            value,
            computed_at: Instant::now(),
        }));
        debug!(
            concurrency = value,
            pool_utilization = signals.pool_utilization,
            "Recomputed recommended concurrency"
        );
        value
    }

    /// Uncached recommendation, always within `[min, max]`
    pub fn compute_concurrency(&self, signals: PressureSignals) -> usize {
        let (min, max) = self.bounds();
        let utilization = if signals.pool_utilization.is_finite() {
            signals.pool_utilization.clamp(0.0, 1.0)
        } else {
            1.0
        };

        let scaled = if utilization < 0.5 {
            max
        } else if utilization < 0.7 {
            (max as f64 * 0.75).floor() as usize
        } else if utilization < 0.85 {
            (max as f64 * 0.5).floor() as usize
        } else {
            min
        };

        let capped = match signals.available_connections {
            Some(available) => scaled.min(available),
            None => scaled,
        };

        capped.clamp(min, max)
    }

    /// Drop the cached recommendation so the next call recomputes
    pub fn invalidate(&self) {
        self.cached.store(None);
    }

    /// `base + steps * per_step`, capped at the configured maximum
    pub fn batch_timeout(&self, steps_in_batch: usize) -> Duration {
        let per_step = self
            .batch_timeout_per_step
            .saturating_mul(u32::try_from(steps_in_batch).unwrap_or(u32::MAX));
        self.batch_timeout_base
            .saturating_add(per_step)
            .min(self.max_batch_timeout)
    }
}
