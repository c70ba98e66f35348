//! Test fixtures for building cycle results and defects.
//!
//! Available outside `cfg(test)` so integration tests and benches can use
//! them too.

use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, Utc};

use crate::collaborators::{CheckResult, Defect, DefectCategory};
use crate::cycle::{classify_outcome, count_by_category, CycleOutcome, CycleResult};

/// Builder for [`CycleResult`] values.
///
/// The outcome is derived the same way the orchestrator derives it unless
/// set explicitly.
///
/// # Example
///
/// ```rust
/// use mender::cycle::CycleOutcome;
/// use mender::testing::CycleResultBuilder;
///
/// let result = CycleResultBuilder::new(1).detected(8).repaired(6).build();
/// assert_eq!(result.outcome, CycleOutcome::Warning);
/// ```
#[derive(Debug, Clone)]
pub struct CycleResultBuilder {
    cycle: u64,
    detected: u32,
    repaired: u32,
    repair_attempts: Option<u32>,
    repair_failures: u32,
    verification: Option<bool>,
    duration_ms: u64,
    outcome: Option<CycleOutcome>,
    defects: Option<Vec<Defect>>,
}

impl CycleResultBuilder {
    #[must_use]
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            detected: 0,
            repaired: 0,
            repair_attempts: None,
            repair_failures: 0,
            verification: None,
            duration_ms: 100,
            outcome: None,
            defects: None,
        }
    }

    #[must_use]
    pub fn detected(mut self, count: u32) -> Self {
        self.detected = count;
        self
    }

    #[must_use]
    pub fn repaired(mut self, count: u32) -> Self {
        self.repaired = count;
        self
    }

    /// Defaults to `repaired + repair_failures`.
    #[must_use]
    pub fn repair_attempts(mut self, count: u32) -> Self {
        self.repair_attempts = Some(count);
        self
    }

    #[must_use]
    pub fn repair_failures(mut self, count: u32) -> Self {
        self.repair_failures = count;
        self
    }

    /// Mark verification as run with the given verdict.
    #[must_use]
    pub fn verification(mut self, passed: bool) -> Self {
        self.verification = Some(passed);
        self
    }

    #[must_use]
    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    #[must_use]
    pub fn outcome(mut self, outcome: CycleOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Record these defects; also sets the detected count.
    #[must_use]
    pub fn defects(mut self, defects: Vec<Defect>) -> Self {
        self.detected = defects.len() as u32;
        self.defects = Some(defects);
        self
    }

    #[must_use]
    pub fn build(self) -> CycleResult {
        let verification_passed = self.verification.unwrap_or(true);
        let outcome = self.outcome.unwrap_or_else(|| {
            classify_outcome(
                false,
                verification_passed,
                self.detected,
                self.repaired,
                self.repair_failures,
            )
        });

        let defects = self.defects.unwrap_or_default();
        let detected_by_category = if defects.is_empty() && self.detected > 0 {
            BTreeMap::from([(DefectCategory::Other, self.detected)])
        } else {
            count_by_category(&defects)
        };
        let repaired_by_category = if self.repaired > 0 {
            BTreeMap::from([(DefectCategory::Other, self.repaired)])
        } else {
            BTreeMap::new()
        };
        let checks = match self.verification {
            Some(passed) => BTreeMap::from([(
                "smoke".to_string(),
                CheckResult {
                    passed,
                    detail: None,
                },
            )]),
            None => BTreeMap::new(),
        };

        let finished_at = Utc::now();
        CycleResult {
            cycle: self.cycle,
            started_at: finished_at - ChronoDuration::milliseconds(self.duration_ms as i64),
            finished_at,
            duration_ms: self.duration_ms,
            defects_detected: self.detected,
            defects_repaired: self.repaired,
            repair_attempts: self
                .repair_attempts
                .unwrap_or(self.repaired + self.repair_failures),
            repair_failures: self.repair_failures,
            detected_by_category,
            repaired_by_category,
            verification_ran: self.verification.is_some(),
            verification_passed,
            checks,
            outcome,
            actions: Vec::new(),
            next_delay_ms: 0,
            defects,
        }
    }
}

/// `count` distinct remediable defects spread across the categories.
pub fn sample_defects(count: usize) -> Vec<Defect> {
    (0..count)
        .map(|i| {
            let category = DefectCategory::ALL[i % DefectCategory::ALL.len()];
            Defect::new(category, format!("sample defect #{i}"))
                .with_location(format!("/page/{}", i % 7))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_success() {
        let result = CycleResultBuilder::new(4).build();
        assert_eq!(result.cycle, 4);
        assert_eq!(result.outcome, CycleOutcome::Success);
        assert!(result.verification_passed);
        assert!(!result.verification_ran);
    }

    #[test]
    fn test_builder_derives_outcome() {
        let failed = CycleResultBuilder::new(1).verification(false).build();
        assert_eq!(failed.outcome, CycleOutcome::Failure);
        assert!(failed.verification_ran);

        let forced = CycleResultBuilder::new(1)
            .verification(false)
            .outcome(CycleOutcome::Warning)
            .build();
        assert_eq!(forced.outcome, CycleOutcome::Warning);
    }

    #[test]
    fn test_builder_defects_set_count() {
        let result = CycleResultBuilder::new(1).defects(sample_defects(6)).build();
        assert_eq!(result.defects_detected, 6);
        assert_eq!(result.detected_by_category.values().sum::<u32>(), 6);
    }

    #[test]
    fn test_sample_defects_are_distinct_and_remediable() {
        let defects = sample_defects(10);
        assert_eq!(defects.len(), 10);
        assert!(defects.iter().all(|d| d.remediable));
        let mut messages: Vec<_> = defects.iter().map(|d| d.message.clone()).collect();
        messages.dedup();
        assert_eq!(messages.len(), 10);
    }
}
