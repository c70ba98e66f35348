//! Session state and its durable storage.
//!
//! A [`Session`] is the record of one continuous monitoring run. It carries
//! every counter the loop needs to resume after a crash without replaying
//! or double-counting a cycle.
//!
//! # Architecture
//!
//! ```text
//! Session
//!   ├── metadata: SessionMetadata (schema version, saved_at, pid)
//!   ├── cycle / totals / last_successful_cycle
//!   ├── emergency: EmergencyState (guard counters)
//!   ├── health + status (derived, refreshed every cycle)
//!   ├── history: bounded recent CycleResults
//!   └── persistence_faults: save failures awaiting the next report
//! ```
//!
//! # Persistence
//!
//! [`persistence::FileSessionStore`] writes the record atomically and always
//! restores it with `running = false`, so a crashed process never looks
//! active.

pub mod persistence;
pub mod signals;

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cycle::{CycleOutcome, CycleResult, MAX_RECORDED_DEFECTS};
use crate::health::HealthSnapshot;
use crate::supervisor::EmergencyState;

pub use persistence::{FileSessionStore, SessionStore};

/// Current schema version for persisted sessions.
/// Increment when making breaking changes to the serialization format.
pub const SESSION_STATE_VERSION: u32 = 1;

/// Minimum supported schema version for backward compatibility.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Default bound on retained cycle results.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Persistence faults retained for reporting.
const MAX_PERSISTENCE_FAULTS: usize = 20;

/// Overall session health as seen by operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Healthy,
    Warning,
    Critical,
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    UserRequested,
    EmergencyConsecutiveFailures,
    EmergencyRepeatedDefect,
    EmergencyRepairAttemptsExhausted,
    FatalInternalError,
    /// A bounded run reached its configured number of cycles
    CycleLimitReached,
}

impl StopReason {
    pub fn is_emergency(&self) -> bool {
        matches!(
            self,
            Self::EmergencyConsecutiveFailures
                | Self::EmergencyRepeatedDefect
                | Self::EmergencyRepairAttemptsExhausted
        )
    }

    /// Process exit code for a run that ended for this reason.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UserRequested | Self::CycleLimitReached => 0,
            Self::EmergencyConsecutiveFailures
            | Self::EmergencyRepeatedDefect
            | Self::EmergencyRepairAttemptsExhausted => 3,
            Self::FatalInternalError => 4,
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserRequested => "user-requested",
            Self::EmergencyConsecutiveFailures => "emergency-consecutive-failures",
            Self::EmergencyRepeatedDefect => "emergency-repeated-defect",
            Self::EmergencyRepairAttemptsExhausted => "emergency-repair-attempts-exhausted",
            Self::FatalInternalError => "fatal-internal-error",
            Self::CycleLimitReached => "cycle-limit-reached",
        };
        write!(f, "{s}")
    }
}

/// Schema and provenance of the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// When this session was last saved.
    pub saved_at: DateTime<Utc>,
    /// Process ID that last wrote this session.
    pub pid: u32,
}

impl SessionMetadata {
    pub const CURRENT_VERSION: u32 = SESSION_STATE_VERSION;

    #[must_use]
    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            saved_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// Updates the saved_at timestamp and PID.
    pub fn touch(&mut self) {
        self.saved_at = Utc::now();
        self.pid = std::process::id();
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative counters over the whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTotals {
    pub errors_detected: u64,
    pub repairs_attempted: u64,
    pub repairs_applied: u64,
    pub repairs_failed: u64,
    pub verifications_run: u64,
    pub verifications_passed: u64,
    pub successful_cycles: u64,
    pub warning_cycles: u64,
    pub failed_cycles: u64,
}

/// A save that did not reach disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceFault {
    pub at: DateTime<Utc>,
    pub cycle: u64,
    pub message: String,
}

/// The durable record of one continuous monitoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub metadata: SessionMetadata,
    pub id: String,
    pub started_at: DateTime<Utc>,
    /// Number of the last completed cycle (0 before the first)
    pub cycle: u64,
    pub totals: SessionTotals,
    pub emergency: EmergencyState,
    pub last_successful_cycle: Option<u64>,
    pub status: SessionStatus,
    pub health: HealthSnapshot,
    /// Whether a controller is currently driving this session
    pub running: bool,
    /// Recent cycle results, oldest first
    pub history: VecDeque<CycleResult>,
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub persistence_faults: VecDeque<PersistenceFault>,
}

impl Session {
    /// Creates a fresh session with a new identifier.
    ///
    /// # Example
    ///
    /// ```rust
    /// use mender::session::{Session, SessionStatus};
    ///
    /// let session = Session::new();
    /// assert_eq!(session.cycle, 0);
    /// assert_eq!(session.status, SessionStatus::Healthy);
    /// assert!(!session.running);
    /// ```
    #[must_use]
    pub fn new() -> Self {
        Self {
            metadata: SessionMetadata::new(),
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            cycle: 0,
            totals: SessionTotals::default(),
            emergency: EmergencyState::default(),
            last_successful_cycle: None,
            status: SessionStatus::Healthy,
            health: HealthSnapshot::default(),
            running: false,
            history: VecDeque::new(),
            stop_reason: None,
            persistence_faults: VecDeque::new(),
        }
    }

    /// Checks if a schema version can be loaded by this build.
    #[must_use]
    pub fn is_compatible_version(version: u32) -> bool {
        (MIN_SUPPORTED_VERSION..=SESSION_STATE_VERSION).contains(&version)
    }

    #[must_use]
    pub fn is_version_compatible(&self) -> bool {
        Self::is_compatible_version(self.metadata.version)
    }

    pub fn is_stopped(&self) -> bool {
        self.status == SessionStatus::Stopped
    }

    /// Number the next cycle will carry.
    pub fn next_cycle_number(&self) -> u64 {
        self.cycle + 1
    }

    /// History as a contiguous slice, oldest first.
    pub fn history_slice(&mut self) -> &[CycleResult] {
        self.history.make_contiguous()
    }

    /// Add a finished cycle's detection/repair/verification counts.
    pub fn accumulate(&mut self, result: &CycleResult) {
        self.totals.errors_detected += u64::from(result.defects_detected);
        self.totals.repairs_attempted += u64::from(result.repair_attempts);
        self.totals.repairs_applied += u64::from(result.defects_repaired);
        self.totals.repairs_failed += u64::from(result.repair_failures);
        if result.verification_ran {
            self.totals.verifications_run += 1;
            if result.verification_passed {
                self.totals.verifications_passed += 1;
            }
        }
    }

    /// Record `result` as the latest completed cycle.
    ///
    /// Cycle numbers must advance by exactly one; anything else is rejected
    /// so a resumed session can never replay or skip a cycle. The stored
    /// defect list is capped at [`MAX_RECORDED_DEFECTS`].
    ///
    /// # Errors
    ///
    /// Returns an internal error if `result.cycle` is not the next cycle.
    pub fn commit_cycle(
        &mut self,
        mut result: CycleResult,
        history_limit: usize,
    ) -> crate::error::Result<()> {
        if result.cycle != self.next_cycle_number() {
            return Err(crate::error::MenderError::internal(format!(
                "cycle {} committed after cycle {}",
                result.cycle, self.cycle
            )));
        }

        self.cycle = result.cycle;
        match result.outcome {
            CycleOutcome::Success => {
                self.totals.successful_cycles += 1;
                self.last_successful_cycle = Some(result.cycle);
            }
            CycleOutcome::Warning => self.totals.warning_cycles += 1,
            CycleOutcome::Failure => self.totals.failed_cycles += 1,
        }

        result.defects.truncate(MAX_RECORDED_DEFECTS);
        self.history.push_back(result);
        while self.history.len() > history_limit {
            self.history.pop_front();
        }
        Ok(())
    }

    /// Remember a failed save so the next report can surface it.
    pub fn record_persistence_fault(&mut self, message: impl Into<String>) {
        self.persistence_faults.push_back(PersistenceFault {
            at: Utc::now(),
            cycle: self.cycle,
            message: message.into(),
        });
        while self.persistence_faults.len() > MAX_PERSISTENCE_FAULTS {
            self.persistence_faults.pop_front();
        }
    }

    /// Updates the metadata timestamp before saving.
    pub fn touch(&mut self) {
        self.metadata.touch();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
