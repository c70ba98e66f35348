//! Mock collaborators and in-memory stores.
//!
//! Each mock collaborator replays a script of steps, one per call, and
//! falls back to a default step once the script runs out. That is enough
//! to stage "fail three times, then recover" or "hang until the timeout".

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::collaborators::{
    CheckResult, Defect, DefectRepairOutcome, Detector, RepairReport, Repairer, ReportSink,
    VerificationReport, Verifier,
};
use crate::error::{MenderError, Result};
use crate::reporting::{AggregateReport, ReportKind};
use crate::session::{Session, SessionStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One scripted response of a mock collaborator.
#[derive(Debug, Clone)]
pub enum MockStep<T> {
    Return(T),
    Fail(String),
    Panic(String),
    /// Sleep, then return the value
    Delay(Duration, T),
}

#[derive(Debug)]
struct Script<T> {
    queue: Mutex<VecDeque<MockStep<T>>>,
    fallback: MockStep<T>,
    calls: AtomicU32,
    closed: AtomicBool,
}

impl<T: Clone> Script<T> {
    fn new(fallback: MockStep<T>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, step: MockStep<T>) {
        lock(&self.queue).push_back(step);
    }

    async fn play(&self) -> anyhow::Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = lock(&self.queue)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            MockStep::Return(value) => Ok(value),
            MockStep::Fail(message) => bail!("{}", message),
            MockStep::Panic(message) => panic!("{}", message),
            MockStep::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        }
    }
}

// ============================================================================
// Detector
// ============================================================================

/// Mock detector. Finds nothing unless told otherwise.
///
/// # Example
///
/// ```rust,ignore
/// let detector = MockDetector::new()
///     .then_fail("browser crashed")
///     .with_defects(sample_defects(3));
/// ```
#[derive(Debug)]
pub struct MockDetector {
    script: Script<Vec<Defect>>,
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDetector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::new(MockStep::Return(Vec::new())),
        }
    }

    /// Defects returned once the script is exhausted.
    #[must_use]
    pub fn with_defects(mut self, defects: Vec<Defect>) -> Self {
        self.script.fallback = MockStep::Return(defects);
        self
    }

    #[must_use]
    pub fn then_defects(self, defects: Vec<Defect>) -> Self {
        self.script.push(MockStep::Return(defects));
        self
    }

    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.script.push(MockStep::Fail(message.to_string()));
        self
    }

    #[must_use]
    pub fn then_panic(self, message: &str) -> Self {
        self.script.push(MockStep::Panic(message.to_string()));
        self
    }

    /// Sleep for `delay`, then return the fallback defects.
    #[must_use]
    pub fn then_delay(self, delay: Duration) -> Self {
        let defects = match &self.script.fallback {
            MockStep::Return(d) | MockStep::Delay(_, d) => d.clone(),
            _ => Vec::new(),
        };
        self.script.push(MockStep::Delay(delay, defects));
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.script.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Detector for MockDetector {
    fn name(&self) -> &str {
        "mock-detector"
    }

    async fn detect(&self, _targets: &[String], _window: Duration) -> anyhow::Result<Vec<Defect>> {
        self.script.play().await
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.script.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Repairer
// ============================================================================

/// Mock repairer. Repairs everything it is given unless limited.
#[derive(Debug)]
pub struct MockRepairer {
    script: Script<()>,
    success_limit: Option<u32>,
}

impl Default for MockRepairer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRepairer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Script::new(MockStep::Return(())),
            success_limit: None,
        }
    }

    /// Repair at most `limit` defects per call; the rest fail.
    #[must_use]
    pub fn with_success_limit(mut self, limit: u32) -> Self {
        self.success_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.script.push(MockStep::Fail(message.to_string()));
        self
    }

    #[must_use]
    pub fn then_panic(self, message: &str) -> Self {
        self.script.push(MockStep::Panic(message.to_string()));
        self
    }

    #[must_use]
    pub fn then_delay(self, delay: Duration) -> Self {
        self.script.push(MockStep::Delay(delay, ()));
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.script.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repairer for MockRepairer {
    fn name(&self) -> &str {
        "mock-repairer"
    }

    async fn repair(&self, defects: &[Defect]) -> anyhow::Result<RepairReport> {
        self.script.play().await?;
        let limit = self.success_limit.unwrap_or(u32::MAX) as usize;
        let outcomes = defects
            .iter()
            .enumerate()
            .map(|(i, defect)| DefectRepairOutcome {
                category: defect.category,
                message: defect.message.clone(),
                succeeded: i < limit,
                detail: (i >= limit).then(|| "mock repair declined".to_string()),
            })
            .collect();
        Ok(RepairReport::from_outcomes(outcomes))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.script.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Verifier
// ============================================================================

/// Mock verifier. Every requested check gets the scripted verdict.
#[derive(Debug)]
pub struct MockVerifier {
    script: Script<bool>,
}

impl MockVerifier {
    #[must_use]
    pub fn passing() -> Self {
        Self {
            script: Script::new(MockStep::Return(true)),
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            script: Script::new(MockStep::Return(false)),
        }
    }

    #[must_use]
    pub fn then_verdict(self, passed: bool) -> Self {
        self.script.push(MockStep::Return(passed));
        self
    }

    #[must_use]
    pub fn then_fail(self, message: &str) -> Self {
        self.script.push(MockStep::Fail(message.to_string()));
        self
    }

    #[must_use]
    pub fn then_delay(self, delay: Duration) -> Self {
        let passed = matches!(self.script.fallback, MockStep::Return(true));
        self.script.push(MockStep::Delay(delay, passed));
        self
    }

    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.script.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    fn name(&self) -> &str {
        "mock-verifier"
    }

    async fn verify(&self, checklist: &BTreeSet<String>) -> anyhow::Result<VerificationReport> {
        let passed = self.script.play().await?;
        let names: Vec<String> = if checklist.is_empty() {
            vec!["default".to_string()]
        } else {
            checklist.iter().cloned().collect()
        };
        let checks: BTreeMap<String, CheckResult> = names
            .into_iter()
            .map(|name| {
                (
                    name,
                    CheckResult {
                        passed,
                        detail: None,
                    },
                )
            })
            .collect();
        Ok(VerificationReport::from_checks(checks))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.script.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Report sink
// ============================================================================

/// Report sink that keeps every report in memory.
///
/// Clones share storage, so a test can keep one and hand another to the
/// controller. Every completed write and the close are also logged in
/// order as `write:<kind>` and `close`.
#[derive(Debug, Clone, Default)]
pub struct MemoryReportSink {
    reports: Arc<Mutex<Vec<AggregateReport>>>,
    events: Arc<Mutex<Vec<String>>>,
    delays: Arc<Mutex<Vec<(ReportKind, Duration)>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryReportSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail.
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sleep for `delay` before completing each write of `kind`.
    pub fn delay_writes(&self, kind: ReportKind, delay: Duration) {
        let mut delays = lock(&self.delays);
        delays.retain(|(k, _)| *k != kind);
        delays.push((kind, delay));
    }

    pub fn reports(&self) -> Vec<AggregateReport> {
        lock(&self.reports).clone()
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    pub fn last(&self) -> Option<AggregateReport> {
        lock(&self.reports).last().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn write(&self, report: &AggregateReport) -> anyhow::Result<()> {
        let delay = lock(&self.delays)
            .iter()
            .find(|(kind, _)| *kind == report.kind)
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            bail!("injected report write failure");
        }
        lock(&self.events).push(format!("write:{}", report.kind));
        lock(&self.reports).push(report.clone());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        lock(&self.events).push("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Session store
// ============================================================================

#[derive(Debug, Default)]
struct StoreState {
    active: Option<Session>,
    archived: Vec<Session>,
    saves: u32,
    /// Saves still to fail; `u32::MAX` fails forever
    failing_saves: u32,
}

/// Session store held in memory. Clones share state, which lets a test
/// "restart" a controller against what the previous one saved.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_session(self, session: Session) -> Self {
        lock(&self.state).active = Some(session);
        self
    }

    pub fn fail_next_saves(&self, count: u32) {
        lock(&self.state).failing_saves = count;
    }

    pub fn fail_all_saves(&self) {
        lock(&self.state).failing_saves = u32::MAX;
    }

    /// The active session exactly as last saved (running flag included).
    pub fn active(&self) -> Option<Session> {
        lock(&self.state).active.clone()
    }

    pub fn archived(&self) -> Vec<Session> {
        lock(&self.state).archived.clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u32 {
        lock(&self.state).saves
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<Session>> {
        Ok(lock(&self.state).active.clone().map(|mut session| {
            session.running = false;
            session
        }))
    }

    fn save(&self, session: &Session) -> Result<()> {
        let mut state = lock(&self.state);
        if state.failing_saves > 0 {
            if state.failing_saves != u32::MAX {
                state.failing_saves -= 1;
            }
            return Err(MenderError::persistence("injected save failure"));
        }
        state.active = Some(session.clone());
        state.saves += 1;
        Ok(())
    }

    fn archive(&self, session: &Session) -> Result<()> {
        let mut state = lock(&self.state);
        if state.active.as_ref().is_some_and(|s| s.id == session.id) {
            state.active = None;
        }
        state.archived.push(session.clone());
        Ok(())
    }
}
