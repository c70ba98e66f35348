//! JSON file report sink.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::AggregateReport;
use crate::collaborators::ReportSink;

/// Name of the copy that always holds the newest report.
pub const LATEST_REPORT: &str = "latest.json";

/// Default number of timestamped reports kept on disk.
pub const DEFAULT_MAX_REPORTS: usize = 100;

/// Writes each report as `report-<session>-<timestamp>.json` plus `latest.json`.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    dir: PathBuf,
    max_reports: usize,
}

impl JsonReportSink {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_reports: DEFAULT_MAX_REPORTS,
        }
    }

    /// Keep at most `max_reports` timestamped files; older ones are pruned.
    #[must_use]
    pub fn with_max_reports(mut self, max_reports: usize) -> Self {
        self.max_reports = max_reports.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self, report: &AggregateReport) -> PathBuf {
        self.dir.join(format!(
            "report-{}-{}.json",
            report.session_id,
            report.generated_at.format("%Y%m%dT%H%M%S%.3fZ")
        ))
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_REPORT)
    }

    async fn write_atomic(&self, path: &Path, contents: &str) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to move report into {}", path.display()))?;
        Ok(())
    }

    async fn prune(&self) -> Result<()> {
        let mut reports = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("report-") && name.ends_with(".json") {
                let modified = entry.metadata().await?.modified()?;
                reports.push((modified, entry.path()));
            }
        }

        if reports.len() <= self.max_reports {
            return Ok(());
        }
        reports.sort();
        let excess = reports.len() - self.max_reports;
        for (_, path) in reports.into_iter().take(excess) {
            debug!(path = %path.display(), "Pruning old report");
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn write(&self, report: &AggregateReport) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        self.write_atomic(&self.report_path(report), &json).await?;
        self.write_atomic(&self.latest_path(), &json).await?;
        self.prune().await
    }
}
