//! Rolling health of the monitored application.
//!
//! The tracker is a pure function over the most recent cycle results. It
//! never stores anything itself; the controller recomputes the snapshot
//! after every cycle and derives the session status from it.

use serde::{Deserialize, Serialize};

use crate::cycle::CycleResult;
use crate::error::{MenderError, Result};
use crate::session::SessionStatus;
use crate::supervisor::{EmergencyState, EmergencyStopGuard};

/// Default number of recent cycles the snapshot is computed over.
pub const DEFAULT_HEALTH_WINDOW: usize = 5;

/// Default verification pass ratio below which the status degrades to warning.
pub const DEFAULT_WARNING_VERIFICATION_RATE: f64 = 0.5;

/// Derived rollup of recent cycle outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Number of cycles the snapshot covers
    pub samples: u32,
    /// Mean defects detected per cycle
    pub error_rate: f64,
    /// Mean defects repaired per cycle
    pub repair_rate: f64,
    /// Fraction of cycles whose verification passed
    pub verification_rate: f64,
    /// Mean cycle duration in milliseconds
    pub avg_duration_ms: f64,
}

impl HealthSnapshot {
    /// Reject snapshots the controller must not act on.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::Internal`] if any rate is NaN, infinite or negative.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("error_rate", self.error_rate),
            ("repair_rate", self.repair_rate),
            ("verification_rate", self.verification_rate),
            ("avg_duration_ms", self.avg_duration_ms),
        ];
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(MenderError::internal(format!(
                    "health snapshot field {name} is {value}"
                )));
            }
        }
        if self.verification_rate > 1.0 {
            return Err(MenderError::internal(format!(
                "verification rate {} exceeds 1.0",
                self.verification_rate
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    window: usize,
    warning_verification_rate: f64,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_WINDOW)
    }
}

impl HealthTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            warning_verification_rate: DEFAULT_WARNING_VERIFICATION_RATE,
        }
    }

    #[must_use]
    pub fn with_warning_verification_rate(mut self, rate: f64) -> Self {
        self.warning_verification_rate = rate;
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Compute the snapshot over the last `window` entries of `history`.
    ///
    /// `history` is ordered oldest first. An empty history yields the
    /// all-zero snapshot.
    pub fn update(&self, history: &[CycleResult]) -> HealthSnapshot {
        let start = history.len().saturating_sub(self.window);
        let recent = &history[start..];
        if recent.is_empty() {
            return HealthSnapshot::default();
        }

        let n = recent.len() as f64;
        let detected: f64 = recent.iter().map(|r| f64::from(r.defects_detected)).sum();
        let repaired: f64 = recent.iter().map(|r| f64::from(r.defects_repaired)).sum();
        let passed = recent.iter().filter(|r| r.verification_passed).count() as f64;
        let duration: f64 = recent.iter().map(|r| r.duration_ms as f64).sum();

        HealthSnapshot {
            samples: recent.len() as u32,
            error_rate: detected / n,
            repair_rate: repaired / n,
            verification_rate: passed / n,
            avg_duration_ms: duration / n,
        }
    }

    /// Derive the session status from guard state and health.
    ///
    /// Never returns [`SessionStatus::Stopped`]; only the controller's
    /// shutdown path moves a session there.
    pub fn classify(
        &self,
        emergency: &EmergencyState,
        guard: &EmergencyStopGuard,
        health: &HealthSnapshot,
    ) -> SessionStatus {
        if guard.tripped(emergency).is_some() {
            SessionStatus::Critical
        } else if emergency.consecutive_failures > 0
            || (health.samples > 0 && health.verification_rate < self.warning_verification_rate)
        {
            SessionStatus::Warning
        } else {
            SessionStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::CycleOutcome;
    use crate::supervisor::GuardLimits;
    use crate::testing::CycleResultBuilder;

    fn result(cycle: u64, detected: u32, repaired: u32, passed: bool, ms: u64) -> CycleResult {
        CycleResultBuilder::new(cycle)
            .detected(detected)
            .repaired(repaired)
            .verification(passed)
            .duration_ms(ms)
            .build()
    }

    #[test]
    fn test_empty_history_is_optimistic_zero() {
        let snapshot = HealthTracker::default().update(&[]);
        assert_eq!(snapshot, HealthSnapshot::default());
        assert_eq!(snapshot.samples, 0);
        assert!(snapshot.validate().is_ok());
    }

    #[test]
    fn test_partial_window_uses_available_samples() {
        let history = vec![result(1, 4, 2, true, 100), result(2, 2, 2, false, 300)];
        let snapshot = HealthTracker::new(5).update(&history);

        assert_eq!(snapshot.samples, 2);
        assert!((snapshot.error_rate - 3.0).abs() < f64::EPSILON);
        assert!((snapshot.repair_rate - 2.0).abs() < f64::EPSILON);
        assert!((snapshot.verification_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.avg_duration_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_only_covers_most_recent() {
        let history: Vec<_> = (1..=8)
            .map(|i| result(i, if i <= 3 { 100 } else { 1 }, 0, true, 10))
            .collect();
        let snapshot = HealthTracker::new(5).update(&history);
        assert_eq!(snapshot.samples, 5);
        assert!((snapshot.error_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fields_bounded_by_observed_values_for_every_window_size() {
        let history: Vec<_> = (1..=5)
            .map(|i| result(i, (i * 7 % 11) as u32, (i * 3 % 5) as u32, i % 2 == 0, i * 250))
            .collect();
        let max_detected = history.iter().map(|r| r.defects_detected).max().unwrap() as f64;
        let max_repaired = history.iter().map(|r| r.defects_repaired).max().unwrap() as f64;
        let max_duration = history.iter().map(|r| r.duration_ms).max().unwrap() as f64;

        let tracker = HealthTracker::new(5);
        for n in 0..=5 {
            let snapshot = tracker.update(&history[..n]);
            assert!(snapshot.validate().is_ok(), "window {n} invalid");
            assert!(snapshot.error_rate >= 0.0 && snapshot.error_rate <= max_detected);
            assert!(snapshot.repair_rate >= 0.0 && snapshot.repair_rate <= max_repaired);
            assert!(snapshot.verification_rate >= 0.0 && snapshot.verification_rate <= 1.0);
            assert!(snapshot.avg_duration_ms >= 0.0 && snapshot.avg_duration_ms <= max_duration);
        }
    }

    #[test]
    fn test_validate_rejects_nan() {
        let snapshot = HealthSnapshot {
            error_rate: f64::NAN,
            ..HealthSnapshot::default()
        };
        assert!(matches!(snapshot.validate(), Err(MenderError::Internal(_))));

        let snapshot = HealthSnapshot {
            verification_rate: 1.5,
            ..HealthSnapshot::default()
        };
        assert!(snapshot.validate().is_err());
    }

    #[test]
    fn test_classify_status() {
        let tracker = HealthTracker::default();
        let guard = EmergencyStopGuard::new(GuardLimits::default());
        let healthy = HealthSnapshot {
            samples: 3,
            verification_rate: 1.0,
            ..HealthSnapshot::default()
        };

        let mut state = EmergencyState::default();
        assert_eq!(tracker.classify(&state, &guard, &healthy), SessionStatus::Healthy);
        assert_eq!(
            tracker.classify(&state, &guard, &HealthSnapshot::default()),
            SessionStatus::Healthy
        );

        state.consecutive_failures = 1;
        assert_eq!(tracker.classify(&state, &guard, &healthy), SessionStatus::Warning);

        state.consecutive_failures = GuardLimits::default().max_consecutive_failures;
        assert_eq!(tracker.classify(&state, &guard, &healthy), SessionStatus::Critical);

        let flaky = HealthSnapshot {
            samples: 4,
            verification_rate: 0.25,
            ..HealthSnapshot::default()
        };
        assert_eq!(
            tracker.classify(&EmergencyState::default(), &guard, &flaky),
            SessionStatus::Warning
        );
    }

    #[test]
    fn test_failure_outcome_does_not_affect_rates_directly() {
        let failed = CycleResultBuilder::new(1)
            .outcome(CycleOutcome::Failure)
            .verification(false)
            .build();
        let snapshot = HealthTracker::default().update(&[failed]);
        assert_eq!(snapshot.samples, 1);
        assert!(snapshot.verification_rate.abs() < f64::EPSILON);
    }
}
