//! End-to-end tests for the loop controller against in-memory and file-backed stores.

use std::sync::Arc;
use std::time::Duration;

use mender::controller::{ControllerConfig, LoopController};
use mender::cycle::{CycleOrchestrator, OrchestratorConfig};
use mender::reporting::{JsonReportSink, ReportKind};
use mender::scheduler::{AdaptiveScheduler, SchedulerConfig};
use mender::session::{FileSessionStore, SessionStatus, SessionStore, StopReason};
use mender::testing::{
    sample_defects, MemoryReportSink, MemorySessionStore, MockDetector, MockRepairer, MockVerifier,
};
use mender::{CycleOutcome, ReportSink};
use tempfile::TempDir;

fn orchestrator(
    detector: MockDetector,
    repairer: MockRepairer,
    verifier: MockVerifier,
) -> CycleOrchestrator {
    CycleOrchestrator::new(
        Arc::new(detector),
        Arc::new(repairer),
        Arc::new(verifier),
        OrchestratorConfig {
            targets: vec!["http://localhost:3000".to_string()],
            collaborator_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        },
    )
}

fn scheduler(base_ms: u64) -> AdaptiveScheduler {
    AdaptiveScheduler::new(SchedulerConfig {
        base_interval: Duration::from_millis(base_ms),
        min_interval: Duration::from_millis(base_ms / 5),
        max_interval: Duration::from_millis(base_ms * 6),
        ..SchedulerConfig::default()
    })
}

fn config(max_cycles: Option<u64>) -> ControllerConfig {
    ControllerConfig {
        max_cycles,
        report_interval: Duration::from_secs(3600),
        ..ControllerConfig::default()
    }
}

#[tokio::test]
async fn test_busy_cycle_shortens_delay_and_stays_healthy() {
    let store = MemorySessionStore::new();
    let sink = MemoryReportSink::new();
    let controller = LoopController::new(
        orchestrator(
            MockDetector::new().with_defects(sample_defects(8)),
            MockRepairer::new().with_success_limit(6),
            MockVerifier::passing(),
        ),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(10_000))
    .with_config(config(Some(1)));

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.final_status, SessionStatus::Healthy);

    let session = store.archived().pop().unwrap();
    let cycle = &session.history[0];
    assert_eq!(cycle.defects_detected, 8);
    assert_eq!(cycle.defects_repaired, 6);
    assert!(cycle.verification_passed);
    assert_eq!(cycle.outcome, CycleOutcome::Warning);
    assert!(cycle.next_delay_ms < 10_000, "busy cycle should shorten the delay");
    assert_eq!(session.emergency.consecutive_failures, 0);
}

#[tokio::test]
async fn test_failed_verifications_trigger_emergency_stop() {
    let store = MemorySessionStore::new();
    let sink = MemoryReportSink::new();
    let controller = LoopController::new(
        orchestrator(
            MockDetector::new().with_defects(sample_defects(2)),
            MockRepairer::new().with_success_limit(0),
            MockVerifier::failing(),
        ),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(20))
    .with_config(config(Some(20)));

    let summary = controller.run().await.unwrap();

    assert_eq!(summary.stop_reason, StopReason::EmergencyConsecutiveFailures);
    assert_eq!(summary.final_status, SessionStatus::Critical);
    assert_eq!(summary.last_cycle, 3);
    assert_eq!(summary.exit_code(), 3);

    let report = sink.last().unwrap();
    assert_eq!(report.kind, ReportKind::Final);
    assert_eq!(report.status, SessionStatus::Critical);
    assert_eq!(report.stop_reason, Some(StopReason::EmergencyConsecutiveFailures));
    assert_eq!(report.failed_cycles().len(), 3);
    assert_eq!(report.totals.repairs_applied, 0);
}

#[tokio::test]
async fn test_restart_after_crash_continues_numbering() {
    let store = MemorySessionStore::new();
    let sink = MemoryReportSink::new();

    let first = LoopController::new(
        orchestrator(MockDetector::new(), MockRepairer::new(), MockVerifier::passing()),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(20))
    .with_config(config(None));

    let (handle, task) = first.spawn();
    let mut updates = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(10), updates.wait_for(|s| s.cycle >= 2))
        .await
        .expect("controller should complete two cycles")
        .unwrap();

    // Simulate a crash: no shutdown path runs
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let crashed = store.active().expect("session saved before the crash");
    assert!(crashed.stop_reason.is_none());
    let crashed_cycle = crashed.cycle;

    let second = LoopController::new(
        orchestrator(MockDetector::new(), MockRepairer::new(), MockVerifier::passing()),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(20))
    .with_config(config(Some(2)));

    let summary = second.run().await.unwrap();
    assert_eq!(summary.session_id, crashed.id);
    assert_eq!(summary.cycles_completed, 2);
    assert_eq!(summary.last_cycle, crashed_cycle + 2);

    let session = store.archived().pop().unwrap();
    let numbers: Vec<u64> = session.history.iter().map(|c| c.cycle).collect();
    assert!(numbers.windows(2).all(|w| w[1] == w[0] + 1), "gap in {numbers:?}");
    assert_eq!(numbers.last().copied(), Some(crashed_cycle + 2));
}

#[tokio::test]
async fn test_graceful_stop_through_handle() {
    let store = MemorySessionStore::new();
    let sink = MemoryReportSink::new();
    let controller = LoopController::new(
        orchestrator(MockDetector::new(), MockRepairer::new(), MockVerifier::passing()),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(50))
    .with_config(config(None));

    let (handle, task) = controller.spawn();
    let mut updates = handle.subscribe();
    updates.wait_for(|s| s.cycle >= 1).await.unwrap();
    handle.stop();

    let summary = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("controller should stop promptly")
        .unwrap()
        .unwrap();

    assert_eq!(summary.stop_reason, StopReason::UserRequested);
    assert!(!summary.forced);
    assert_eq!(summary.exit_code(), 0);
    assert!(sink.is_closed());
    assert_eq!(store.archived().len(), 1);
}

#[tokio::test]
async fn test_file_backed_run_persists_and_archives() {
    let temp = TempDir::new().unwrap();
    let store = FileSessionStore::new(temp.path().join(".mender"));
    let sink = JsonReportSink::new(temp.path().join(".mender/reports"));

    let controller = LoopController::new(
        orchestrator(
            MockDetector::new().with_defects(sample_defects(1)),
            MockRepairer::new(),
            MockVerifier::passing(),
        ),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(20))
    .with_config(config(Some(2)));

    let summary = controller.run().await.unwrap();
    assert_eq!(summary.stop_reason, StopReason::CycleLimitReached);

    assert!(!store.exists());
    assert!(store.archive_path(&summary.session_id).exists());
    assert!(store.load().unwrap().is_none());

    let archived = store.latest_archived().unwrap().unwrap();
    assert_eq!(archived.id, summary.session_id);
    assert_eq!(archived.cycle, 2);
    assert_eq!(archived.status, SessionStatus::Stopped);
    assert_eq!(archived.totals.errors_detected, 2);
    assert_eq!(archived.totals.repairs_applied, 2);

    let latest: mender::AggregateReport =
        serde_json::from_str(&std::fs::read_to_string(sink.latest_path()).unwrap()).unwrap();
    assert_eq!(latest.kind, ReportKind::Final);
    assert_eq!(latest.session_id, summary.session_id);

    // A new run starts a fresh session
    let next = LoopController::new(
        orchestrator(MockDetector::new(), MockRepairer::new(), MockVerifier::passing()),
        Arc::new(store.clone()),
        Arc::new(sink.clone()),
    )
    .with_scheduler(scheduler(20))
    .with_config(config(Some(1)));
    let next_summary = next.run().await.unwrap();
    assert_ne!(next_summary.session_id, summary.session_id);
    assert_eq!(next_summary.last_cycle, 1);

    sink.close().await.unwrap();
}
