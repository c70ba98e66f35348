//! Aggregate reports and the periodic emitter.
//!
//! The emitter runs on its own timer, reads the session snapshot the
//! controller publishes after every change and hands a report to the
//! configured [`ReportSink`]. It never touches the session itself, so a slow
//! or failing sink cannot stall the loop.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::reporting::{ReportEmitter, sink::JsonReportSink};
//!
//! let sink = Arc::new(JsonReportSink::new(".mender/reports"));
//! let emitter = ReportEmitter::new(sink, Duration::from_secs(300));
//! let task = emitter.spawn(session_rx, stop_rx);
//! ```

pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collaborators::ReportSink;
use crate::cycle::{CycleOutcome, CycleResult};
use crate::health::HealthSnapshot;
use crate::session::{PersistenceFault, Session, SessionStatus, SessionTotals, StopReason};

pub use sink::JsonReportSink;

/// Default time between periodic reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(300);

/// Hard limit on a single sink write.
const SINK_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a report was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportKind {
    Periodic,
    /// Written once while the controller is stopping
    Final,
    /// Requested from the command line
    OnDemand,
}

impl std::fmt::Display for ReportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Periodic => write!(f, "periodic"),
            Self::Final => write!(f, "final"),
            Self::OnDemand => write!(f, "on-demand"),
        }
    }
}

/// Cumulative view of a session at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    pub session_id: String,
    pub kind: ReportKind,
    pub generated_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Last completed cycle
    pub cycle: u64,
    pub running: bool,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub totals: SessionTotals,
    pub health: HealthSnapshot,
    pub consecutive_failures: u32,
    pub last_successful_cycle: Option<u64>,
    /// Fraction of detected defects that were repaired
    pub repair_ratio: f64,
    /// Recent cycles, oldest first
    pub cycles: Vec<CycleResult>,
    pub persistence_faults: Vec<PersistenceFault>,
}

impl AggregateReport {
    /// Build a report from a session snapshot.
    pub fn from_session(session: &Session, kind: ReportKind) -> Self {
        let totals = session.totals;
        let repair_ratio = if totals.errors_detected == 0 {
            0.0
        } else {
            totals.repairs_applied as f64 / totals.errors_detected as f64
        };

        Self {
            session_id: session.id.clone(),
            kind,
            generated_at: Utc::now(),
            started_at: session.started_at,
            cycle: session.cycle,
            running: session.running,
            status: session.status,
            stop_reason: session.stop_reason,
            totals,
            health: session.health,
            consecutive_failures: session.emergency.consecutive_failures,
            last_successful_cycle: session.last_successful_cycle,
            repair_ratio,
            cycles: session.history.iter().cloned().collect(),
            persistence_faults: session.persistence_faults.iter().cloned().collect(),
        }
    }

    /// Drop persistence faults already covered by an earlier report.
    #[must_use]
    pub fn with_faults_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        if let Some(since) = since {
            self.persistence_faults.retain(|f| f.at > since);
        }
        self
    }

    /// Failed cycles among the recent history.
    pub fn failed_cycles(&self) -> Vec<&CycleResult> {
        self.cycles
            .iter()
            .filter(|c| c.outcome == CycleOutcome::Failure)
            .collect()
    }
}

/// Writes an [`AggregateReport`] on a fixed interval.
pub struct ReportEmitter {
    sink: Arc<dyn ReportSink>,
    interval: Duration,
}

impl ReportEmitter {
    pub fn new(sink: Arc<dyn ReportSink>, interval: Duration) -> Self {
        Self { sink, interval }
    }

    /// Run until `stop` turns true or its sender is dropped.
    ///
    /// The task resolves to the number of reports written.
    pub fn spawn(
        self,
        snapshots: watch::Receiver<Session>,
        stop: watch::Receiver<bool>,
    ) -> JoinHandle<u32> {
        tokio::spawn(self.run(snapshots, stop))
    }

    async fn run(self, snapshots: watch::Receiver<Session>, mut stop: watch::Receiver<bool>) -> u32 {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_report_at: Option<DateTime<Utc>> = None;
        let mut written = 0;

        debug!(interval_secs = self.interval.as_secs_f64(), "Report emitter started");

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let session = snapshots.borrow().clone();
                    let report = AggregateReport::from_session(&session, ReportKind::Periodic)
                        .with_faults_since(last_report_at);
                    if write_report(self.sink.as_ref(), &report).await {
                        last_report_at = Some(report.generated_at);
                        written += 1;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(written, "Report emitter stopped");
        written
    }
}

/// Write `report` through `sink`, logging rather than returning failures.
pub async fn write_report(sink: &dyn ReportSink, report: &AggregateReport) -> bool {
    match tokio::time::timeout(SINK_WRITE_TIMEOUT, sink.write(report)).await {
        Ok(Ok(())) => {
            info!(
                session_id = %report.session_id,
                kind = %report.kind,
                cycle = report.cycle,
                "Report written"
            );
            true
        }
        Ok(Err(e)) => {
            warn!(kind = %report.kind, "Failed to write report: {:#}", e);
            false
        }
        Err(_) => {
            warn!(
                kind = %report.kind,
                "Report sink timed out after {}s",
                SINK_WRITE_TIMEOUT.as_secs()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CycleResultBuilder, MemoryReportSink};

    fn session_with_cycles(outcomes: &[bool]) -> Session {
        let mut session = Session::new();
        for (i, passed) in outcomes.iter().enumerate() {
            let result = CycleResultBuilder::new(i as u64 + 1)
                .detected(2)
                .repaired(if *passed { 2 } else { 0 })
                .verification(*passed)
                .build();
            session.accumulate(&result);
            session.commit_cycle(result, 10).unwrap();
        }
        session
    }

    #[test]
    fn test_report_from_session() {
        let session = session_with_cycles(&[true, false, false]);
        let report = AggregateReport::from_session(&session, ReportKind::Final);

        assert_eq!(report.session_id, session.id);
        assert_eq!(report.cycle, 3);
        assert_eq!(report.cycles.len(), 3);
        assert_eq!(report.failed_cycles().len(), 2);
        assert_eq!(report.totals.errors_detected, 6);
        assert!((report.repair_ratio - 2.0 / 6.0).abs() < 1e-9);
        assert_eq!(report.kind, ReportKind::Final);
    }

    #[test]
    fn test_report_without_defects_has_zero_ratio() {
        let report = AggregateReport::from_session(&Session::new(), ReportKind::OnDemand);
        assert_eq!(report.repair_ratio, 0.0);
        assert!(report.cycles.is_empty());
    }

    #[test]
    fn test_faults_since_filters_old_faults() {
        let mut session = Session::new();
        session.record_persistence_fault("first");
        let cutoff = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        session.record_persistence_fault("second");

        let report =
            AggregateReport::from_session(&session, ReportKind::Periodic).with_faults_since(Some(cutoff));
        assert_eq!(report.persistence_faults.len(), 1);
        assert_eq!(report.persistence_faults[0].message, "second");

        let all = AggregateReport::from_session(&session, ReportKind::Periodic).with_faults_since(None);
        assert_eq!(all.persistence_faults.len(), 2);
    }

    #[test]
    fn test_report_json_is_camel_case() {
        let report = AggregateReport::from_session(&Session::new(), ReportKind::Periodic);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("sessionId").is_some());
        assert!(json.get("stopReason").is_some());
        assert_eq!(json["kind"], "periodic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_writes_on_interval_and_stops() {
        let sink = MemoryReportSink::new();
        let (_session_tx, session_rx) = watch::channel(session_with_cycles(&[true]));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = ReportEmitter::new(Arc::new(sink.clone()), Duration::from_secs(60))
            .spawn(session_rx, stop_rx);

        tokio::time::sleep(Duration::from_secs(185)).await;
        stop_tx.send(true).unwrap();
        let written = task.await.unwrap();

        assert_eq!(written, 3);
        assert_eq!(sink.reports().len(), 3);
        assert!(sink.reports().iter().all(|r| r.kind == ReportKind::Periodic));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_reads_latest_snapshot() {
        let sink = MemoryReportSink::new();
        let (session_tx, session_rx) = watch::channel(Session::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = ReportEmitter::new(Arc::new(sink.clone()), Duration::from_secs(10))
            .spawn(session_rx, stop_rx);

        session_tx.send(session_with_cycles(&[true, true])).unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(sink.last().unwrap().cycle, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emitter_survives_failing_sink() {
        let sink = MemoryReportSink::new();
        sink.fail_writes(true);
        let (_session_tx, session_rx) = watch::channel(Session::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = ReportEmitter::new(Arc::new(sink.clone()), Duration::from_secs(10))
            .spawn(session_rx, stop_rx);

        tokio::time::sleep(Duration::from_secs(25)).await;
        sink.fail_writes(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        drop(stop_tx);

        assert_eq!(task.await.unwrap(), 1);
    }
}
