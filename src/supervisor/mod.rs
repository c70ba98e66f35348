//! Emergency stop guard - watches failure counters and halts the loop.
//!
//! The guard runs once per cycle, right after the orchestrator returns and
//! before any delay is scheduled. It tracks three independent counters and
//! issues a [`GuardVerdict::Stop`] the first time any of them reaches its
//! limit. A stop is irreversible for the session.
//!
//! # Modules
//!
//! - [`signature`] - configurable defect identity for repeat counting

pub mod signature;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cycle::{CycleOutcome, CycleResult};
use crate::session::StopReason;

pub use signature::{ExactSignature, NormalizedSignature, SignatureMode, SignatureStrategy};

/// Default consecutive failed cycles before an emergency stop
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Default total repair attempts allowed in one session
pub const DEFAULT_MAX_REPAIR_ATTEMPTS: u64 = 200;

/// Default number of window cycles a signature may appear in before stopping
pub const DEFAULT_REPEATED_DEFECT_LIMIT: u32 = 5;

/// Default number of recent cycles kept for signature counting
pub const DEFAULT_SIGNATURE_WINDOW: usize = 10;

/// Thresholds the guard enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardLimits {
    pub max_consecutive_failures: u32,
    pub max_repair_attempts: u64,
    pub repeated_defect_limit: u32,
    pub signature_window: usize,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            max_repair_attempts: DEFAULT_MAX_REPAIR_ATTEMPTS,
            repeated_defect_limit: DEFAULT_REPEATED_DEFECT_LIMIT,
            signature_window: DEFAULT_SIGNATURE_WINDOW,
        }
    }
}

/// Counters the guard maintains across cycles; persisted with the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyState {
    /// Failed cycles in a row; reset by a successful cycle
    pub consecutive_failures: u32,
    /// Repair attempts over the whole session
    pub repair_attempts: u64,
    /// Distinct defect signatures of each recent cycle, oldest first
    pub recent_signatures: VecDeque<Vec<String>>,
}

impl EmergencyState {
    /// Number of window cycles in which each signature appeared.
    pub fn signature_counts(&self) -> BTreeMap<&str, u32> {
        let mut counts = BTreeMap::new();
        for cycle in &self.recent_signatures {
            for signature in cycle {
                *counts.entry(signature.as_str()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// The most frequently repeated signature and its count.
    pub fn most_repeated(&self) -> Option<(String, u32)> {
        self.signature_counts()
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(signature, count)| (signature.to_string(), count))
    }
}

/// Guard decision for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardVerdict {
    /// Keep looping
    Proceed,
    /// Halt the session
    Stop { reason: StopReason, detail: String },
}

impl GuardVerdict {
    pub fn should_stop(&self) -> bool {
        matches!(self, Self::Stop { .. })
    }

    pub fn reason(&self) -> Option<StopReason> {
        match self {
            Self::Proceed => None,
            Self::Stop { reason, .. } => Some(*reason),
        }
    }
}

impl std::fmt::Display for GuardVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "PROCEED"),
            Self::Stop { reason, detail } => write!(f, "STOP ({}): {}", reason, detail),
        }
    }
}

/// The emergency stop guard.
#[derive(Debug, Clone)]
pub struct EmergencyStopGuard {
    limits: GuardLimits,
    signatures: Arc<dyn SignatureStrategy>,
}

impl EmergencyStopGuard {
    /// Create a guard using exact message signatures.
    pub fn new(limits: GuardLimits) -> Self {
        Self {
            limits,
            signatures: Arc::new(ExactSignature),
        }
    }

    #[must_use]
    pub fn with_signatures(mut self, signatures: Arc<dyn SignatureStrategy>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn limits(&self) -> &GuardLimits {
        &self.limits
    }

    /// Fold `result` into `state` and decide whether the loop must stop.
    pub fn evaluate(&self, state: &mut EmergencyState, result: &CycleResult) -> GuardVerdict {
        match result.outcome {
            CycleOutcome::Failure => state.consecutive_failures += 1,
            CycleOutcome::Success => state.consecutive_failures = 0,
            CycleOutcome::Warning => {}
        }

        state.repair_attempts += u64::from(result.repair_attempts);

        let mut signatures: Vec<String> = result
            .defects
            .iter()
            .map(|d| self.signatures.signature(d))
            .collect();
        signatures.sort();
        signatures.dedup();
        state.recent_signatures.push_back(signatures);
        while state.recent_signatures.len() > self.limits.signature_window {
            state.recent_signatures.pop_front();
        }

        debug!(
            consecutive_failures = state.consecutive_failures,
            repair_attempts = state.repair_attempts,
            "Guard counters updated"
        );

        match self.tripped(state) {
            Some((reason, detail)) => {
                warn!(reason = %reason, "Emergency stop: {}", detail);
                GuardVerdict::Stop { reason, detail }
            }
            None => GuardVerdict::Proceed,
        }
    }

    /// Which limit, if any, `state` has reached.
    pub fn tripped(&self, state: &EmergencyState) -> Option<(StopReason, String)> {
        if state.consecutive_failures >= self.limits.max_consecutive_failures {
            return Some((
                StopReason::EmergencyConsecutiveFailures,
                format!(
                    "{} consecutive failed cycles (limit {})",
                    state.consecutive_failures, self.limits.max_consecutive_failures
                ),
            ));
        }

        if let Some((signature, count)) = state.most_repeated() {
            if count >= self.limits.repeated_defect_limit {
                return Some((
                    StopReason::EmergencyRepeatedDefect,
                    format!(
                        "defect '{}' seen in {} of the last {} cycles (limit {})",
                        signature,
                        count,
                        state.recent_signatures.len(),
                        self.limits.repeated_defect_limit
                    ),
                ));
            }
        }

        if state.repair_attempts >= self.limits.max_repair_attempts {
            return Some((
                StopReason::EmergencyRepairAttemptsExhausted,
                format!(
                    "{} repair attempts (limit {})",
                    state.repair_attempts, self.limits.max_repair_attempts
                ),
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Defect, DefectCategory};
    use crate::testing::CycleResultBuilder;

    fn guard() -> EmergencyStopGuard {
        EmergencyStopGuard::new(GuardLimits {
            max_consecutive_failures: 3,
            max_repair_attempts: 50,
            repeated_defect_limit: 3,
            signature_window: 4,
        })
    }

    fn failure(cycle: u64) -> CycleResult {
        CycleResultBuilder::new(cycle)
            .verification(false)
            .build()
    }

    fn success(cycle: u64) -> CycleResult {
        CycleResultBuilder::new(cycle).build()
    }

    #[test]
    fn test_three_consecutive_failures_stop() {
        let guard = guard();
        let mut state = EmergencyState::default();

        assert!(!guard.evaluate(&mut state, &failure(1)).should_stop());
        assert!(!guard.evaluate(&mut state, &failure(2)).should_stop());
        let verdict = guard.evaluate(&mut state, &failure(3));

        assert!(verdict.should_stop());
        assert_eq!(
            verdict.reason(),
            Some(StopReason::EmergencyConsecutiveFailures)
        );
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let guard = guard();
        let mut state = EmergencyState::default();

        guard.evaluate(&mut state, &failure(1));
        guard.evaluate(&mut state, &failure(2));
        let verdict = guard.evaluate(&mut state, &success(3));

        assert_eq!(verdict, GuardVerdict::Proceed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_warning_leaves_consecutive_failures_unchanged() {
        let guard = guard();
        let mut state = EmergencyState::default();
        guard.evaluate(&mut state, &failure(1));

        let warning = CycleResultBuilder::new(2)
            .outcome(CycleOutcome::Warning)
            .build();
        guard.evaluate(&mut state, &warning);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[test]
    fn test_repair_attempts_are_monotonic() {
        let guard = guard();
        let mut state = EmergencyState::default();

        for cycle in 1..=4 {
            let result = CycleResultBuilder::new(cycle).repair_attempts(12).build();
            assert!(!guard.evaluate(&mut state, &result).should_stop());
        }
        assert_eq!(state.repair_attempts, 48);

        let result = CycleResultBuilder::new(5).repair_attempts(2).build();
        let verdict = guard.evaluate(&mut state, &result);
        assert_eq!(
            verdict.reason(),
            Some(StopReason::EmergencyRepairAttemptsExhausted)
        );
    }

    #[test]
    fn test_repeated_defect_across_cycles() {
        let guard = guard();
        let mut state = EmergencyState::default();
        let defect = Defect::new(DefectCategory::Runtime, "TypeError: tickets is undefined");

        for cycle in 1..=2 {
            let result = CycleResultBuilder::new(cycle)
                .defects(vec![defect.clone(), defect.clone()])
                .build();
            assert!(!guard.evaluate(&mut state, &result).should_stop());
        }
        assert_eq!(state.most_repeated().unwrap().1, 2);

        let result = CycleResultBuilder::new(3).defects(vec![defect]).build();
        let verdict = guard.evaluate(&mut state, &result);
        assert_eq!(verdict.reason(), Some(StopReason::EmergencyRepeatedDefect));
    }

    #[test]
    fn test_signature_window_ages_out() {
        let guard = guard();
        let mut state = EmergencyState::default();
        let defect = Defect::new(DefectCategory::Network, "GET /api 502");

        for cycle in 1..=2 {
            let result = CycleResultBuilder::new(cycle)
                .defects(vec![defect.clone()])
                .build();
            guard.evaluate(&mut state, &result);
        }
        for cycle in 3..=6 {
            guard.evaluate(&mut state, &success(cycle));
        }
        assert_eq!(state.recent_signatures.len(), 4);
        assert!(state.most_repeated().is_none());

        let result = CycleResultBuilder::new(7).defects(vec![defect]).build();
        assert!(!guard.evaluate(&mut state, &result).should_stop());
    }

    #[test]
    fn test_normalized_signatures_merge_variants() {
        let guard = guard().with_signatures(Arc::new(NormalizedSignature::default()));
        let mut state = EmergencyState::default();

        let mut verdict = GuardVerdict::Proceed;
        for (cycle, ms) in [(1, 3012), (2, 2990), (3, 3100)] {
            let defect = Defect::new(DefectCategory::Network, format!("timeout after {ms}ms"));
            let result = CycleResultBuilder::new(cycle).defects(vec![defect]).build();
            verdict = guard.evaluate(&mut state, &result);
        }
        assert_eq!(verdict.reason(), Some(StopReason::EmergencyRepeatedDefect));
    }

    #[test]
    fn test_verdict_display() {
        assert_eq!(GuardVerdict::Proceed.to_string(), "PROCEED");
        let verdict = GuardVerdict::Stop {
            reason: StopReason::EmergencyConsecutiveFailures,
            detail: "3 consecutive failed cycles".into(),
        };
        let display = verdict.to_string();
        assert!(display.contains("emergency-consecutive-failures"));
        assert!(display.contains("3 consecutive"));
    }
}
