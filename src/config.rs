//! Monitor configuration loaded from `.mender/settings.json`.
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration (apart from the targets, which the command line can
//! supply). Keys are camelCase.
//!
//! ```json
//! {
//!   "targets": ["http://localhost:3000/", "http://localhost:3000/tickets"],
//!   "schedule": { "baseInterval": 60, "minInterval": 10, "maxInterval": 300 },
//!   "guard": { "maxConsecutiveFailures": 3, "repeatedDefectLimit": 5 },
//!   "signatureMode": "normalized",
//!   "repair": { "strategies": { "markup": "./scripts/fix-markup.sh" } },
//!   "verification": { "checks": { "smoke": "curl -fsS http://localhost:3000/health" } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::{
    CommandDetector, CommandRepairStrategy, CommandVerifier, DefectCategory, Detector,
    HttpProbeDetector, Repairer, StrategyRepairer, Verifier,
};
use crate::controller::{ControllerConfig, LoopController};
use crate::cycle::{CycleOrchestrator, OrchestratorConfig};
use crate::error::{MenderError, Result};
use crate::health::HealthTracker;
use crate::reporting::JsonReportSink;
use crate::scheduler::{AdaptiveScheduler, SchedulerConfig};
use crate::session::FileSessionStore;
use crate::supervisor::{EmergencyStopGuard, GuardLimits, SignatureMode};

/// Directory holding settings, session state and reports.
pub const STATE_DIR: &str = ".mender";

/// Which built-in detector to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Probe targets over HTTP
    #[default]
    Http,
    /// Run a command that prints defects as JSON
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorConfig {
    pub kind: DetectorKind,
    /// Shell command for [`DetectorKind::Command`]
    pub command: Option<String>,
    pub request_timeout_secs: u64,
    pub probe_interval_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            kind: DetectorKind::Http,
            command: None,
            request_timeout_secs: 15,
            probe_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepairConfig {
    pub enabled: bool,
    /// Repair command per defect category
    pub strategies: BTreeMap<DefectCategory, String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategies: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationConfig {
    pub enabled: bool,
    /// Check name to shell command
    pub checks: BTreeMap<String, String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checks: BTreeMap::new(),
        }
    }
}

/// Everything the `run` command needs to assemble a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorConfig {
    pub targets: Vec<String>,
    pub observation_window_secs: u64,
    pub collaborator_timeout_secs: u64,
    pub report_interval_secs: u64,
    /// Relative paths resolve against the project directory
    pub state_dir: PathBuf,
    pub history_limit: usize,
    pub health_window: usize,
    pub warning_verification_rate: f64,
    pub max_consecutive_save_failures: u32,
    pub max_cycles: Option<u64>,
    pub max_reports: usize,
    pub schedule: SchedulerConfig,
    pub guard: GuardLimits,
    pub signature_mode: SignatureMode,
    pub detector: DetectorConfig,
    pub repair: RepairConfig,
    pub verification: VerificationConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            observation_window_secs: 30,
            collaborator_timeout_secs: 120,
            report_interval_secs: 300,
            state_dir: PathBuf::from(STATE_DIR),
            history_limit: crate::session::DEFAULT_HISTORY_LIMIT,
            health_window: crate::health::DEFAULT_HEALTH_WINDOW,
            warning_verification_rate: crate::health::DEFAULT_WARNING_VERIFICATION_RATE,
            max_consecutive_save_failures: crate::controller::DEFAULT_MAX_CONSECUTIVE_SAVE_FAILURES,
            max_cycles: None,
            max_reports: crate::reporting::sink::DEFAULT_MAX_REPORTS,
            schedule: SchedulerConfig::default(),
            guard: GuardLimits::default(),
            signature_mode: SignatureMode::default(),
            detector: DetectorConfig::default(),
            repair: RepairConfig::default(),
            verification: VerificationConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a project directory.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::Config`] if the settings file exists but
    /// cannot be read or parsed.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);
        if !settings_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&settings_path).map_err(|e| {
            MenderError::config_with_path(format!("failed to read settings: {e}"), settings_path.clone())
        })?;
        serde_json::from_str(&content).map_err(|e| {
            MenderError::config_with_path(format!("failed to parse settings: {e}"), settings_path)
        })
    }

    /// Get the settings.json path for a project
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR).join("settings.json")
    }

    /// Resolved state directory for a project
    pub fn state_dir(&self, project_dir: &Path) -> PathBuf {
        if self.state_dir.is_absolute() {
            self.state_dir.clone()
        } else {
            project_dir.join(&self.state_dir)
        }
    }

    /// Get the reports directory
    pub fn reports_dir(&self, project_dir: &Path) -> PathBuf {
        self.state_dir(project_dir).join("reports")
    }

    // =========================================================================
    // Overrides
    // =========================================================================

    /// Append targets given on the command line.
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<String>) -> Self {
        for target in targets {
            if !self.targets.contains(&target) {
                self.targets.push(target);
            }
        }
        self
    }

    /// Override the base interval. The min and max bounds move with it,
    /// keeping their configured ratios to the base.
    #[must_use]
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        let old_base = self.schedule.base_interval.as_nanos();
        if old_base > 0 {
            let rescale = |bound: Duration| {
                let nanos = bound
                    .as_nanos()
                    .checked_mul(interval.as_nanos())
                    .map_or(u128::MAX, |n| n / old_base);
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            };
            self.schedule.min_interval = rescale(self.schedule.min_interval);
            self.schedule.max_interval = rescale(self.schedule.max_interval);
        }
        self.schedule.base_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_cycles(mut self, max_cycles: Option<u64>) -> Self {
        if max_cycles.is_some() {
            self.max_cycles = max_cycles;
        }
        self
    }

    #[must_use]
    pub fn with_repair(mut self, enabled: bool) -> Self {
        self.repair.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verification.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_report_interval(mut self, secs: u64) -> Self {
        self.report_interval_secs = secs;
        self
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check the configuration for values the controller cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`MenderError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.schedule.validate()?;

        if self.detector.kind == DetectorKind::Http && self.targets.is_empty() {
            return Err(MenderError::invalid_config(
                "targets",
                "at least one target URL is required for the http detector",
            ));
        }
        if self.detector.kind == DetectorKind::Command
            && self.detector.command.as_deref().is_none_or(|c| c.trim().is_empty())
        {
            return Err(MenderError::invalid_config(
                "detector.command",
                "required when detector.kind is \"command\"",
            ));
        }

        let positive = [
            ("observationWindowSecs", self.observation_window_secs),
            ("collaboratorTimeoutSecs", self.collaborator_timeout_secs),
            ("reportIntervalSecs", self.report_interval_secs),
            ("detector.requestTimeoutSecs", self.detector.request_timeout_secs),
            ("guard.maxRepairAttempts", self.guard.max_repair_attempts),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(MenderError::invalid_config(field, "must be greater than zero"));
            }
        }

        if self.history_limit == 0 {
            return Err(MenderError::invalid_config("historyLimit", "must be at least 1"));
        }
        if self.health_window == 0 || self.health_window > self.history_limit {
            return Err(MenderError::invalid_config(
                "healthWindow",
                format!("must be between 1 and historyLimit ({})", self.history_limit),
            ));
        }
        if !(0.0..=1.0).contains(&self.warning_verification_rate) {
            return Err(MenderError::invalid_config(
                "warningVerificationRate",
                "must be between 0 and 1",
            ));
        }
        if self.max_consecutive_save_failures == 0 {
            return Err(MenderError::invalid_config(
                "maxConsecutiveSaveFailures",
                "must be at least 1",
            ));
        }
        if self.guard.max_consecutive_failures == 0 {
            return Err(MenderError::invalid_config(
                "guard.maxConsecutiveFailures",
                "must be at least 1",
            ));
        }
        if self.guard.repeated_defect_limit == 0 {
            return Err(MenderError::invalid_config(
                "guard.repeatedDefectLimit",
                "must be at least 1",
            ));
        }
        if self.guard.signature_window < self.guard.repeated_defect_limit as usize {
            return Err(MenderError::invalid_config(
                "guard.signatureWindow",
                format!(
                    "must be at least repeatedDefectLimit ({})",
                    self.guard.repeated_defect_limit
                ),
            ));
        }
        if self.max_cycles == Some(0) {
            return Err(MenderError::invalid_config("maxCycles", "must be at least 1"));
        }

        Ok(())
    }

    // =========================================================================
    // Assembly
    // =========================================================================

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            targets: self.targets.clone(),
            observation_window: Duration::from_secs(self.observation_window_secs),
            repair_enabled: self.repair.enabled,
            verification_enabled: self.verification.enabled,
            checklist: self.verification.checks.keys().cloned().collect(),
            collaborator_timeout: Duration::from_secs(self.collaborator_timeout_secs),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            history_limit: self.history_limit,
            report_interval: Duration::from_secs(self.report_interval_secs),
            max_cycles: self.max_cycles,
            max_consecutive_save_failures: self.max_consecutive_save_failures,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the command
    /// detector has no command.
    pub fn build_detector(&self, project_dir: &Path) -> Result<Arc<dyn Detector>> {
        match self.detector.kind {
            DetectorKind::Http => {
                let detector =
                    HttpProbeDetector::new(Duration::from_secs(self.detector.request_timeout_secs))?
                        .with_probe_interval(Duration::from_secs(self.detector.probe_interval_secs));
                Ok(Arc::new(detector))
            }
            DetectorKind::Command => {
                let command = self.detector.command.clone().ok_or_else(|| {
                    MenderError::invalid_config("detector.command", "missing")
                })?;
                Ok(Arc::new(CommandDetector::new(command, project_dir)))
            }
        }
    }

    pub fn build_repairer(&self, project_dir: &Path) -> Arc<dyn Repairer> {
        let repairer = self
            .repair
            .strategies
            .iter()
            .fold(StrategyRepairer::new(), |repairer, (category, command)| {
                repairer.with_strategy(
                    *category,
                    Arc::new(CommandRepairStrategy::new(
                        format!("{category}-command"),
                        command.clone(),
                        project_dir,
                    )),
                )
            });
        Arc::new(repairer)
    }

    pub fn build_verifier(&self, project_dir: &Path) -> Arc<dyn Verifier> {
        let verifier = self
            .verification
            .checks
            .iter()
            .fold(CommandVerifier::new(project_dir), |verifier, (name, command)| {
                verifier.with_check(name.clone(), command.clone())
            });
        Arc::new(verifier)
    }

    pub fn build_guard(&self) -> EmergencyStopGuard {
        EmergencyStopGuard::new(self.guard).with_signatures(Arc::from(self.signature_mode.strategy()))
    }

    pub fn build_scheduler(&self) -> AdaptiveScheduler {
        AdaptiveScheduler::new(self.schedule)
    }

    pub fn build_health_tracker(&self) -> HealthTracker {
        HealthTracker::new(self.health_window)
            .with_warning_verification_rate(self.warning_verification_rate)
    }

    pub fn build_store(&self, project_dir: &Path) -> FileSessionStore {
        FileSessionStore::new(self.state_dir(project_dir))
    }

    pub fn build_sink(&self, project_dir: &Path) -> JsonReportSink {
        JsonReportSink::new(self.reports_dir(project_dir)).with_max_reports(self.max_reports)
    }

    /// Validate, then wire every component into a controller.
    ///
    /// # Errors
    ///
    /// Returns the first validation or construction error.
    pub fn build_controller(&self, project_dir: &Path) -> Result<LoopController> {
        self.validate()?;

        let orchestrator = CycleOrchestrator::new(
            self.build_detector(project_dir)?,
            self.build_repairer(project_dir),
            self.build_verifier(project_dir),
            self.orchestrator_config(),
        );

        Ok(LoopController::new(
            orchestrator,
            Arc::new(self.build_store(project_dir)),
            Arc::new(self.build_sink(project_dir)),
        )
        .with_health_tracker(self.build_health_tracker())
        .with_guard(self.build_guard())
        .with_scheduler(self.build_scheduler())
        .with_config(self.controller_config()))
    }
}
