//! Adaptive pacing between cycles.
//!
//! Busy cycles shorten the wait so repairs are re-checked sooner; quiet,
//! verified cycles stretch it so a healthy application is left alone.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cycle::{CycleOutcome, CycleResult};
use crate::error::{MenderError, Result};

/// Tunables for [`AdaptiveScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    /// Delay used when nothing calls for a change
    #[serde(with = "secs")]
    pub base_interval: Duration,
    /// Shortest delay a busy cycle may produce
    #[serde(with = "secs")]
    pub min_interval: Duration,
    /// Longest delay a quiet cycle may produce
    #[serde(with = "secs")]
    pub max_interval: Duration,
    /// Detected defects above which a cycle counts as busy
    pub high_water: u32,
    pub busy_factor: f64,
    pub quiet_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(300),
            high_water: 5,
            busy_factor: 0.5,
            quiet_factor: 2.0,
        }
    }
}

impl SchedulerConfig {
    /// Check that busy delays land below the base and quiet delays above it.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.base_interval.is_zero() {
            return Err(MenderError::invalid_config(
                "baseInterval",
                "must be greater than zero",
            ));
        }
        if self.min_interval >= self.base_interval {
            return Err(MenderError::invalid_config(
                "minInterval",
                format!(
                    "{}s must be below baseInterval {}s",
                    self.min_interval.as_secs_f64(),
                    self.base_interval.as_secs_f64()
                ),
            ));
        }
        if self.max_interval <= self.base_interval {
            return Err(MenderError::invalid_config(
                "maxInterval",
                format!(
                    "{}s must be above baseInterval {}s",
                    self.max_interval.as_secs_f64(),
                    self.base_interval.as_secs_f64()
                ),
            ));
        }
        if !(self.busy_factor > 0.0 && self.busy_factor < 1.0) {
            return Err(MenderError::invalid_config(
                "busyFactor",
                "must be between 0 and 1 (exclusive)",
            ));
        }
        if !(self.quiet_factor > 1.0 && self.quiet_factor.is_finite()) {
            return Err(MenderError::invalid_config(
                "quietFactor",
                "must be greater than 1",
            ));
        }
        Ok(())
    }
}

/// Chooses the delay before the next cycle from the one just finished.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Delay before the cycle after `result`.
    ///
    /// - more than `high_water` defects: `max(base * busy_factor, min_interval)`
    /// - no defects, verification passed, not a failure: `min(base * quiet_factor, max_interval)`
    /// - otherwise: `base`
    pub fn next_delay(&self, result: &CycleResult, base: Duration) -> Duration {
        if result.defects_detected > self.config.high_water {
            return base
                .mul_f64(self.config.busy_factor)
                .max(self.config.min_interval);
        }

        if result.defects_detected == 0
            && result.verification_passed
            && result.outcome != CycleOutcome::Failure
        {
            return base
                .mul_f64(self.config.quiet_factor)
                .min(self.config.max_interval);
        }

        base
    }
}

/// Serialize a [`Duration`] as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
