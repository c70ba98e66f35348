//! Shell-command backed collaborators.
//!
//! These let a deployment plug existing scripts (a headless-browser crawl,
//! a patch script, an end-to-end suite) into the loop without writing Rust.
//! Commands run through `sh -c` in the project directory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::repair::{RepairStrategy, StrategyOutcome};
use super::{CheckResult, Defect, Detector, VerificationReport, Verifier};

/// Longest stderr excerpt carried into fault messages.
const MAX_STDERR_EXCERPT: usize = 500;

/// Run `command` through `sh -c`, optionally feeding `stdin`.
async fn run_shell(
    command: &str,
    workdir: &Path,
    envs: &[(&str, String)],
    stdin: Option<&[u8]>,
) -> Result<Output> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn `{command}`"))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // A command may exit without draining stdin.
        match pipe.write_all(input).await {
            Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
        drop(pipe);
    }

    Ok(child.wait_with_output().await?)
}

fn stderr_excerpt(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let trimmed = stderr.trim();
    if trimmed.len() > MAX_STDERR_EXCERPT {
        let mut end = MAX_STDERR_EXCERPT;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

/// Detector that runs a command printing a JSON array of [`Defect`]s.
///
/// The command sees `MENDER_TARGETS` (newline separated) and
/// `MENDER_WINDOW_SECS` in its environment.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    command: String,
    workdir: PathBuf,
}

impl CommandDetector {
    pub fn new(command: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl Detector for CommandDetector {
    fn name(&self) -> &str {
        "command-detector"
    }

    async fn detect(&self, targets: &[String], window: Duration) -> Result<Vec<Defect>> {
        let envs = [
            ("MENDER_TARGETS", targets.join("\n")),
            ("MENDER_WINDOW_SECS", window.as_secs().to_string()),
        ];
        let output = run_shell(&self.command, &self.workdir, &envs, None).await?;

        if !output.status.success() {
            bail!(
                "detector command exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr_excerpt(&output)
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        let defects: Vec<Defect> = serde_json::from_str(stdout.trim())
            .context("detector command did not print a JSON array of defects")?;
        debug!(count = defects.len(), "Command detector reported defects");
        Ok(defects)
    }
}

/// Repair strategy that pipes the defect as JSON into a command.
///
/// Exit status 0 means the defect was repaired.
#[derive(Debug, Clone)]
pub struct CommandRepairStrategy {
    name: String,
    command: String,
    workdir: PathBuf,
}

impl CommandRepairStrategy {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            workdir: workdir.into(),
        }
    }
}

#[async_trait]
impl RepairStrategy for CommandRepairStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, defect: &Defect) -> Result<StrategyOutcome> {
        let payload = serde_json::to_vec(defect)?;
        let envs = [("MENDER_DEFECT_CATEGORY", defect.category.to_string())];
        let output = run_shell(&self.command, &self.workdir, &envs, Some(&payload)).await?;

        if output.status.success() {
            Ok(StrategyOutcome::repaired())
        } else {
            Ok(StrategyOutcome::not_repaired(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr_excerpt(&output)
            )))
        }
    }
}

/// Verifier that maps each check name to a command; exit 0 passes.
#[derive(Debug, Clone, Default)]
pub struct CommandVerifier {
    checks: BTreeMap<String, String>,
    workdir: PathBuf,
}

impl CommandVerifier {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            checks: BTreeMap::new(),
            workdir: workdir.into(),
        }
    }

    #[must_use]
    pub fn with_check(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.checks.insert(name.into(), command.into());
        self
    }

    /// Names of checks this verifier knows how to run.
    pub fn known_checks(&self) -> BTreeSet<String> {
        self.checks.keys().cloned().collect()
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    fn name(&self) -> &str {
        "command-verifier"
    }

    async fn verify(&self, checklist: &BTreeSet<String>) -> Result<VerificationReport> {
        let mut results = BTreeMap::new();

        for check in checklist {
            let result = match self.checks.get(check) {
                None => CheckResult {
                    passed: false,
                    detail: Some("no command configured for this check".to_string()),
                },
                Some(command) => {
                    let output = run_shell(command, &self.workdir, &[], None).await?;
                    if output.status.success() {
                        CheckResult {
                            passed: true,
                            detail: None,
                        }
                    } else {
                        CheckResult {
                            passed: false,
                            detail: Some(format!(
                                "exit {}: {}",
                                output.status.code().unwrap_or(-1),
                                stderr_excerpt(&output)
                            )),
                        }
                    }
                }
            };
            debug!(check = %check, passed = result.passed, "Verification check finished");
            results.insert(check.clone(), result);
        }

        Ok(VerificationReport::from_checks(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DefectCategory;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_command_detector_parses_json() {
        let temp = TempDir::new().unwrap();
        let detector = CommandDetector::new(
            r#"echo '[{"category":"runtime","message":"ReferenceError: foo","remediable":true}]'"#,
            temp.path(),
        );

        let defects = detector
            .detect(&["http://localhost".to_string()], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].category, DefectCategory::Runtime);
        assert!(defects[0].remediable);
    }

    #[tokio::test]
    async fn test_command_detector_sees_targets() {
        let temp = TempDir::new().unwrap();
        let detector = CommandDetector::new(
            r#"printf '[{"category":"other","message":"%s"}]' "$MENDER_TARGETS""#,
            temp.path(),
        );

        let defects = detector
            .detect(&["http://a.test".to_string()], Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(defects[0].message, "http://a.test");
    }

    #[tokio::test]
    async fn test_command_detector_empty_output_is_no_defects() {
        let temp = TempDir::new().unwrap();
        let detector = CommandDetector::new("true", temp.path());
        let defects = detector.detect(&[], Duration::from_secs(1)).await.unwrap();
        assert!(defects.is_empty());
    }

    #[tokio::test]
    async fn test_command_detector_failure_is_error() {
        let temp = TempDir::new().unwrap();
        let detector = CommandDetector::new("echo browser crashed >&2; exit 2", temp.path());
        let err = detector
            .detect(&[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("browser crashed"));
    }

    #[tokio::test]
    async fn test_command_detector_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let detector = CommandDetector::new("echo not-json", temp.path());
        assert!(detector.detect(&[], Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_command_repair_strategy_reads_defect_from_stdin() {
        let temp = TempDir::new().unwrap();
        let strategy = CommandRepairStrategy::new(
            "grep-runtime",
            r#"grep -q '"category":"runtime"'"#,
            temp.path(),
        );

        let fixed = strategy
            .apply(&Defect::new(DefectCategory::Runtime, "boom"))
            .await
            .unwrap();
        assert!(fixed.repaired);

        let not_fixed = strategy
            .apply(&Defect::new(DefectCategory::Markup, "boom"))
            .await
            .unwrap();
        assert!(!not_fixed.repaired);
    }

    #[tokio::test]
    async fn test_command_verifier_runs_named_checks() {
        let temp = TempDir::new().unwrap();
        let verifier = CommandVerifier::new(temp.path())
            .with_check("smoke", "true")
            .with_check("e2e", "exit 1");

        let only_smoke: BTreeSet<String> = ["smoke".to_string()].into_iter().collect();
        let report = verifier.verify(&only_smoke).await.unwrap();
        assert!(report.overall_passed);

        let report = verifier.verify(&verifier.known_checks()).await.unwrap();
        assert!(!report.overall_passed);
        assert!(!report.checks["e2e"].passed);
        assert!(report.checks["smoke"].passed);
    }

    #[tokio::test]
    async fn test_command_verifier_unknown_check_fails() {
        let temp = TempDir::new().unwrap();
        let verifier = CommandVerifier::new(temp.path());
        let checklist: BTreeSet<String> = ["missing".to_string()].into_iter().collect();
        let report = verifier.verify(&checklist).await.unwrap();
        assert!(!report.overall_passed);
    }
}
