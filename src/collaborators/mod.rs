//! Collaborator contracts consumed by the loop controller.
//!
//! Detection, repair, verification and report writing are all external to
//! the controller. Each one is a trait with a single operation, so a
//! deployment can swap a browser-driven detector for an HTTP prober (or a
//! mock in tests) without the orchestrator noticing.
//!
//! # Reference implementations
//!
//! - [`http::HttpProbeDetector`] - probes target endpoints over HTTP
//! - [`command::CommandDetector`] - runs a shell command that prints defects as JSON
//! - [`repair::StrategyRepairer`] - dispatches defects to per-category [`repair::RepairStrategy`]s
//! - [`command::CommandVerifier`] - one shell command per named check
//!
//! Report sinks live in [`crate::reporting::sink`].

pub mod command;
pub mod http;
pub mod repair;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::reporting::AggregateReport;

pub use command::{CommandDetector, CommandRepairStrategy, CommandVerifier};
pub use http::HttpProbeDetector;
pub use repair::{RepairStrategy, StrategyRepairer};

/// Broad class of a detected defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefectCategory {
    /// Uncaught exception or crash inside the application
    Runtime,
    /// Failed or erroring network request
    Network,
    /// Broken or missing markup
    Markup,
    /// Usability or accessibility problem
    Usability,
    /// Anything the detector could not classify
    Other,
}

impl DefectCategory {
    /// All categories, in reporting order.
    pub const ALL: [DefectCategory; 5] = [
        Self::Runtime,
        Self::Network,
        Self::Markup,
        Self::Usability,
        Self::Other,
    ];
}

impl std::fmt::Display for DefectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Runtime => write!(f, "runtime"),
            Self::Network => write!(f, "network"),
            Self::Markup => write!(f, "markup"),
            Self::Usability => write!(f, "usability"),
            Self::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for DefectCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "runtime" => Ok(Self::Runtime),
            "network" => Ok(Self::Network),
            "markup" => Ok(Self::Markup),
            "usability" => Ok(Self::Usability),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown defect category '{other}'")),
        }
    }
}

/// How bad a defect is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Medium
    }
}

/// A classified problem surfaced by a [`Detector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defect {
    pub category: DefectCategory,
    #[serde(default)]
    pub severity: Severity,
    pub message: String,
    /// Where the defect was observed (URL, file:line, selector)
    #[serde(default, alias = "locationHint")]
    pub location: Option<String>,
    /// Whether the detector believes automated repair is possible
    #[serde(default)]
    pub remediable: bool,
}

impl Defect {
    /// Create a remediable defect with medium severity.
    pub fn new(category: DefectCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: Severity::Medium,
            message: message.into(),
            location: None,
            remediable: true,
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[must_use]
    pub fn with_remediable(mut self, remediable: bool) -> Self {
        self.remediable = remediable;
        self
    }
}

/// Outcome of repairing a single defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectRepairOutcome {
    pub category: DefectCategory,
    pub message: String,
    pub succeeded: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Result of one [`Repairer::repair`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub outcomes: Vec<DefectRepairOutcome>,
}

impl RepairReport {
    /// Build a report from per-defect outcomes, deriving the counters.
    pub fn from_outcomes(outcomes: Vec<DefectRepairOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.succeeded).count() as u32;
        let attempted = outcomes.len() as u32;
        Self {
            attempted,
            succeeded,
            failed: attempted - succeeded,
            outcomes,
        }
    }

    /// Repaired defect counts per category.
    pub fn succeeded_by_category(&self) -> BTreeMap<DefectCategory, u32> {
        let mut counts = BTreeMap::new();
        for outcome in self.outcomes.iter().filter(|o| o.succeeded) {
            *counts.entry(outcome.category).or_insert(0) += 1;
        }
        counts
    }
}

/// Result of a single named verification check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Result of one [`Verifier::verify`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub overall_passed: bool,
    pub checks: BTreeMap<String, CheckResult>,
}

impl VerificationReport {
    /// Build a report whose overall verdict is the conjunction of all checks.
    ///
    /// An empty check map passes.
    pub fn from_checks(checks: BTreeMap<String, CheckResult>) -> Self {
        Self {
            overall_passed: checks.values().all(|c| c.passed),
            checks,
        }
    }
}

/// Surfaces defects in the monitored application.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Short name used in logs and fault messages.
    fn name(&self) -> &str {
        "detector"
    }

    /// Observe `targets` for `window` and return every classified defect.
    ///
    /// # Errors
    ///
    /// Returns an error if observation itself could not be carried out.
    async fn detect(&self, targets: &[String], window: Duration) -> Result<Vec<Defect>>;

    /// Release held resources (browser sessions, connections).
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Attempts automated remediation of defects.
#[async_trait]
pub trait Repairer: Send + Sync {
    fn name(&self) -> &str {
        "repairer"
    }

    /// Whether this repairer is willing to attempt `defect`.
    fn can_repair(&self, defect: &Defect) -> bool {
        defect.remediable
    }

    /// Attempt to repair every defect in `defects`.
    ///
    /// # Errors
    ///
    /// Returns an error only when the repair machinery itself broke; a
    /// defect that could not be fixed is reported in [`RepairReport`].
    async fn repair(&self, defects: &[Defect]) -> Result<RepairReport>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Re-checks the monitored application after repair.
#[async_trait]
pub trait Verifier: Send + Sync {
    fn name(&self) -> &str {
        "verifier"
    }

    /// Run the checks named in `checklist`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checks could not be executed at all.
    async fn verify(&self, checklist: &BTreeSet<String>) -> Result<VerificationReport>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Receives aggregate reports; rendering and storage are its concern.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Persist or publish `report`.
    ///
    /// # Errors
    ///
    /// Returns an error if the report could not be written.
    async fn write(&self, report: &AggregateReport) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
