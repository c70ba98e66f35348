//! Cycle results and the orchestrator that produces them.
//!
//! A cycle is one detect → repair → verify pass. Its [`CycleResult`] is the
//! only thing the health tracker, the emergency stop guard and the scheduler
//! ever look at.

pub mod orchestrator;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{CheckResult, Defect, DefectCategory};

pub use orchestrator::{CycleOrchestrator, OrchestratorConfig};

/// Maximum defects kept verbatim per cycle in the session history.
///
/// Counts are always exact, and the guard sees the full list before the
/// result is committed; only the stored list is capped.
pub const MAX_RECORDED_DEFECTS: usize = 200;

/// Classification of a finished cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Success,
    Warning,
    Failure,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// Everything that happened in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub defects_detected: u32,
    pub defects_repaired: u32,
    pub repair_attempts: u32,
    pub repair_failures: u32,
    pub detected_by_category: BTreeMap<DefectCategory, u32>,
    pub repaired_by_category: BTreeMap<DefectCategory, u32>,
    /// Whether the verifier was invoked this cycle
    pub verification_ran: bool,
    pub verification_passed: bool,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckResult>,
    pub outcome: CycleOutcome,
    /// Human-readable log of what the cycle did
    pub actions: Vec<String>,
    /// Delay chosen before the following cycle, stamped by the controller
    pub next_delay_ms: u64,
    /// Detected defects; capped at [`MAX_RECORDED_DEFECTS`] once committed
    #[serde(default)]
    pub defects: Vec<Defect>,
}

impl CycleResult {
    pub fn is_failure(&self) -> bool {
        self.outcome == CycleOutcome::Failure
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Success
    }
}

/// Decide the outcome of a cycle from what its collaborators reported.
///
/// A fault or a failed verification is a failure. Otherwise any failed or
/// missing repair downgrades the cycle to a warning.
pub fn classify_outcome(
    faulted: bool,
    verification_passed: bool,
    defects_detected: u32,
    defects_repaired: u32,
    repair_failures: u32,
) -> CycleOutcome {
    if faulted || !verification_passed {
        CycleOutcome::Failure
    } else if repair_failures > 0 || defects_repaired < defects_detected {
        CycleOutcome::Warning
    } else {
        CycleOutcome::Success
    }
}

/// Count defects per category.
pub fn count_by_category(defects: &[Defect]) -> BTreeMap<DefectCategory, u32> {
    let mut counts = BTreeMap::new();
    for defect in defects {
        *counts.entry(defect.category).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_outcome() {
        assert_eq!(classify_outcome(true, true, 0, 0, 0), CycleOutcome::Failure);
        assert_eq!(classify_outcome(false, false, 0, 0, 0), CycleOutcome::Failure);
        assert_eq!(classify_outcome(false, true, 8, 6, 2), CycleOutcome::Warning);
        assert_eq!(classify_outcome(false, true, 3, 0, 0), CycleOutcome::Warning);
        assert_eq!(classify_outcome(false, true, 4, 4, 0), CycleOutcome::Success);
        assert_eq!(classify_outcome(false, true, 0, 0, 0), CycleOutcome::Success);
    }

    #[test]
    fn test_count_by_category() {
        let defects = vec![
            Defect::new(DefectCategory::Network, "a"),
            Defect::new(DefectCategory::Network, "b"),
            Defect::new(DefectCategory::Runtime, "c"),
        ];
        let counts = count_by_category(&defects);
        assert_eq!(counts[&DefectCategory::Network], 2);
        assert_eq!(counts[&DefectCategory::Runtime], 1);
        assert!(!counts.contains_key(&DefectCategory::Markup));
    }

    #[test]
    fn test_outcome_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&CycleOutcome::Failure).unwrap(),
            "\"failure\""
        );
        assert_eq!(CycleOutcome::Warning.to_string(), "warning");
    }
}
