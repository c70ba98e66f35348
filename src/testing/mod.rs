//! Testing infrastructure for mender.
//!
//! Scripted collaborators, in-memory stores and result builders for
//! exercising the loop without a real application, browser or disk.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::testing::{sample_defects, MockDetector, MockRepairer, MockVerifier};
//!
//! let detector = MockDetector::new().with_defects(sample_defects(8));
//! let repairer = MockRepairer::new().with_success_limit(6);
//! let verifier = MockVerifier::passing();
//! ```

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{Detector, Repairer, ReportSink, Verifier};
    use crate::reporting::AggregateReport;
    use crate::session::{Session, SessionStore};
    use std::collections::BTreeSet;
    use std::time::Duration;

    // =========================================================================
    // Mock Collaborator Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_detector_replays_script_then_fallback() {
        let detector = MockDetector::new()
            .with_defects(sample_defects(2))
            .then_fail("browser crashed")
            .then_defects(Vec::new());

        assert!(detector.detect(&[], Duration::ZERO).await.is_err());
        assert!(detector.detect(&[], Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(detector.detect(&[], Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(detector.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_repairer_success_limit() {
        let repairer = MockRepairer::new().with_success_limit(1);
        let report = repairer.repair(&sample_defects(3)).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_mock_verifier_checks_follow_checklist() {
        let verifier = MockVerifier::passing().then_verdict(false);
        let checklist: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();

        let first = verifier.verify(&checklist).await.unwrap();
        assert!(!first.overall_passed);
        assert_eq!(first.checks.len(), 2);

        let second = verifier.verify(&BTreeSet::new()).await.unwrap();
        assert!(second.overall_passed);
        assert!(second.checks.contains_key("default"));
    }

    // =========================================================================
    // In-memory Store Tests
    // =========================================================================

    #[tokio::test]
    async fn test_memory_sink_shares_reports_between_clones() {
        let sink = MemoryReportSink::new();
        let handle = sink.clone();
        let report = AggregateReport::from_session(&Session::new(), crate::reporting::ReportKind::Periodic);

        sink.write(&report).await.unwrap();
        assert_eq!(handle.reports().len(), 1);

        handle.fail_writes(true);
        assert!(sink.write(&report).await.is_err());
    }

    #[test]
    fn test_memory_store_load_clears_running() {
        let mut session = Session::new();
        session.running = true;
        let store = MemorySessionStore::new().with_session(session.clone());

        assert!(store.active().unwrap().running);
        let loaded = store.load().unwrap().unwrap();
        assert!(!loaded.running);
        assert_eq!(loaded.id, session.id);
    }

    #[test]
    fn test_memory_store_injected_failures() {
        let store = MemorySessionStore::new();
        store.fail_next_saves(2);

        assert!(store.save(&Session::new()).is_err());
        assert!(store.save(&Session::new()).is_err());
        assert!(store.save(&Session::new()).is_ok());
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_memory_store_archive_clears_matching_active() {
        let session = Session::new();
        let store = MemorySessionStore::new().with_session(session.clone());
        store.archive(&session).unwrap();
        assert!(store.active().is_none());
        assert_eq!(store.archived().len(), 1);
    }
}
