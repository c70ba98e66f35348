//! One detect → repair → verify pass.
//!
//! Every collaborator call runs under a hard timeout and inside a panic
//! boundary. A fault in any stage ends the cycle as a failure and skips the
//! stages after it; the message lands in the cycle's action log. Nothing is
//! retried within a cycle.

use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use super::{classify_outcome, count_by_category, CycleResult};
use crate::collaborators::{Defect, Detector, Repairer, Verifier};
use crate::error::{panic_message, IntoMenderError, MenderError};
use crate::session::Session;

/// Default hard timeout for a single collaborator call.
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time the detector observes the targets per cycle.
pub const DEFAULT_OBSERVATION_WINDOW: Duration = Duration::from_secs(30);

/// What a cycle looks at and which stages it runs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub targets: Vec<String>,
    pub observation_window: Duration,
    pub repair_enabled: bool,
    pub verification_enabled: bool,
    /// Check names passed to the verifier
    pub checklist: BTreeSet<String>,
    pub collaborator_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            observation_window: DEFAULT_OBSERVATION_WINDOW,
            repair_enabled: true,
            verification_enabled: true,
            checklist: BTreeSet::new(),
            collaborator_timeout: DEFAULT_COLLABORATOR_TIMEOUT,
        }
    }
}

/// Runs cycles against a fixed set of collaborators.
pub struct CycleOrchestrator {
    detector: Arc<dyn Detector>,
    repairer: Arc<dyn Repairer>,
    verifier: Arc<dyn Verifier>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for CycleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleOrchestrator")
            .field("detector", &self.detector.name())
            .field("repairer", &self.repairer.name())
            .field("verifier", &self.verifier.name())
            .field("config", &self.config)
            .finish()
    }
}

impl CycleOrchestrator {
    pub fn new(
        detector: Arc<dyn Detector>,
        repairer: Arc<dyn Repairer>,
        verifier: Arc<dyn Verifier>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            detector,
            repairer,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one cycle numbered `session.cycle + 1`.
    ///
    /// Adds the cycle's detection, repair and verification counts to the
    /// session totals. Does not commit the cycle or touch status; that is
    /// the controller's job.
    pub async fn run_cycle(&self, session: &mut Session) -> CycleResult {
        let cycle = session.next_cycle_number();
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut actions = Vec::new();
        let mut fault: Option<MenderError> = None;

        debug!(cycle, "Cycle started");

        // Detect
        let defects = match self
            .guarded(
                self.detector.name(),
                self.detector
                    .detect(&self.config.targets, self.config.observation_window),
            )
            .await
        {
            Ok(defects) => {
                actions.push(format!(
                    "detected {} defect(s) across {} target(s)",
                    defects.len(),
                    self.config.targets.len()
                ));
                defects
            }
            Err(e) => {
                actions.push(format!("detection failed: {e}"));
                fault = Some(e);
                Vec::new()
            }
        };

        // Repair
        let mut repair_attempts = 0;
        let mut repair_failures = 0;
        let mut defects_repaired = 0;
        let mut repaired_by_category = Default::default();
        if fault.is_none() && self.config.repair_enabled && !defects.is_empty() {
            let repairable: Vec<Defect> = defects
                .iter()
                .filter(|d| self.repairer.can_repair(d))
                .cloned()
                .collect();

            if repairable.is_empty() {
                actions.push("no repairable defects".to_string());
            } else {
                match self
                    .guarded(self.repairer.name(), self.repairer.repair(&repairable))
                    .await
                {
                    Ok(report) => {
                        repair_attempts = report.attempted;
                        repair_failures = report.failed;
                        defects_repaired = report.succeeded.min(defects.len() as u32);
                        repaired_by_category = report.succeeded_by_category();
                        actions.push(format!(
                            "repaired {} of {} attempted defect(s)",
                            report.succeeded, report.attempted
                        ));
                    }
                    Err(e) => {
                        actions.push(format!("repair failed: {e}"));
                        fault = Some(e);
                    }
                }
            }
        } else if !self.config.repair_enabled && !defects.is_empty() {
            actions.push("repair disabled".to_string());
        }

        // Verify
        let mut verification_ran = false;
        let mut verification_passed = fault.is_none();
        let mut checks = Default::default();
        if fault.is_none() && self.config.verification_enabled {
            match self
                .guarded(
                    self.verifier.name(),
                    self.verifier.verify(&self.config.checklist),
                )
                .await
            {
                Ok(report) => {
                    verification_ran = true;
                    verification_passed = report.overall_passed;
                    let failed = report.checks.values().filter(|c| !c.passed).count();
                    actions.push(if report.overall_passed {
                        format!("verification passed ({} check(s))", report.checks.len())
                    } else {
                        format!(
                            "verification failed ({failed} of {} check(s))",
                            report.checks.len()
                        )
                    });
                    checks = report.checks;
                }
                Err(e) => {
                    actions.push(format!("verification failed: {e}"));
                    verification_passed = false;
                    fault = Some(e);
                }
            }
        }

        let defects_detected = defects.len() as u32;
        let outcome = classify_outcome(
            fault.is_some(),
            verification_passed,
            defects_detected,
            defects_repaired,
            repair_failures,
        );

        let detected_by_category = count_by_category(&defects);

        let result = CycleResult {
            cycle,
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            defects_detected,
            defects_repaired,
            repair_attempts,
            repair_failures,
            detected_by_category,
            repaired_by_category,
            verification_ran,
            verification_passed,
            checks,
            outcome,
            actions,
            next_delay_ms: 0,
            defects,
        };

        session.accumulate(&result);

        match &fault {
            Some(e) => warn!(cycle, outcome = %result.outcome, "Cycle faulted: {}", e),
            None => info!(
                cycle,
                outcome = %result.outcome,
                detected = result.defects_detected,
                repaired = result.defects_repaired,
                verified = result.verification_passed,
                duration_ms = result.duration_ms,
                "Cycle finished"
            ),
        }

        result
    }

    /// Release every collaborator. Failures are logged, never returned.
    pub async fn close_all(&self) {
        let closes = [
            (self.detector.name(), self.detector.close()),
            (self.repairer.name(), self.repairer.close()),
            (self.verifier.name(), self.verifier.close()),
        ];
        for (name, close) in closes {
            if let Err(e) = self.guarded(name, close).await {
                warn!("Failed to close {}: {}", name, e);
            }
        }
    }

    async fn guarded<T, F>(&self, name: &str, call: F) -> Result<T, MenderError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let timeout = self.config.collaborator_timeout;
        match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
            Ok(Ok(result)) => result.into_mender_collaborator(name),
            Ok(Err(payload)) => Err(MenderError::CollaboratorPanicked {
                collaborator: name.to_string(),
                message: panic_message(payload.as_ref()),
            }),
            Err(_) => Err(MenderError::CollaboratorTimeout {
                collaborator: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
