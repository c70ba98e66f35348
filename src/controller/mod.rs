//! The loop controller: runs cycles until something tells it to stop.
//!
//! # Lifecycle
//!
//! ```text
//! idle ──run()──► running ──stop / guard / fault / cycle limit──► stopping ──► stopped
//! ```
//!
//! While running, each iteration:
//!
//! 1. checks for a pending stop request and for an already-tripped guard
//! 2. runs one cycle (a force stop interrupts it)
//! 3. folds the result into the guard, history, health and status
//! 4. saves the session and publishes a snapshot
//! 5. sleeps for the scheduled delay (any stop request wakes it)
//!
//! The session is owned by the controller task. Everyone else sees it
//! through the snapshot published on a `watch` channel.

pub mod shutdown;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::ReportSink;
use crate::cycle::{CycleOrchestrator, CycleResult};
use crate::error::{panic_message, MenderError, Result};
use crate::health::HealthTracker;
use crate::reporting::{ReportEmitter, DEFAULT_REPORT_INTERVAL};
use crate::scheduler::AdaptiveScheduler;
use crate::session::{Session, SessionStatus, SessionStore, StopReason, DEFAULT_HISTORY_LIMIT};
use crate::supervisor::{EmergencyStopGuard, GuardLimits, GuardVerdict};

use shutdown::Exit;

/// Default number of consecutive failed saves that stop the loop.
pub const DEFAULT_MAX_CONSECUTIVE_SAVE_FAILURES: u32 = 5;

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Pending stop request. Only ever escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    None,
    /// Finish the current cycle, then stop cleanly
    Graceful,
    /// Abandon the current cycle and skip cleanup
    Force,
}

/// Controller-level settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub history_limit: usize,
    pub report_interval: Duration,
    /// Stop after this many cycles in one run
    pub max_cycles: Option<u64>,
    pub max_consecutive_save_failures: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            report_interval: DEFAULT_REPORT_INTERVAL,
            max_cycles: None,
            max_consecutive_save_failures: DEFAULT_MAX_CONSECUTIVE_SAVE_FAILURES,
        }
    }
}

/// Outcome of a finished [`LoopController::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub session_id: String,
    pub stop_reason: StopReason,
    /// Cycles completed by this run
    pub cycles_completed: u64,
    /// Number of the session's last completed cycle
    pub last_cycle: u64,
    /// Status the session had when it began stopping
    pub final_status: SessionStatus,
    /// Whether shutdown was forced
    pub forced: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        self.stop_reason.exit_code()
    }
}

/// Cloneable remote control for a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    stop_tx: Arc<watch::Sender<StopRequest>>,
    session_rx: watch::Receiver<Session>,
    state_rx: watch::Receiver<ControllerState>,
}

impl ControllerHandle {
    /// Ask for a graceful stop after the in-flight cycle.
    pub fn stop(&self) {
        let requested = self.stop_tx.send_if_modified(|request| {
            if *request == StopRequest::None {
                *request = StopRequest::Graceful;
                true
            } else {
                false
            }
        });
        if requested {
            info!("Graceful stop requested");
        }
    }

    /// Stop now: interrupt the in-flight cycle and skip cleanup.
    pub fn force_stop(&self) {
        let requested = self.stop_tx.send_if_modified(|request| {
            if *request == StopRequest::Force {
                false
            } else {
                *request = StopRequest::Force;
                true
            }
        });
        if requested {
            warn!("Force stop requested");
        }
    }

    /// Latest published session snapshot.
    pub fn status(&self) -> Session {
        self.session_rx.borrow().clone()
    }

    pub fn state(&self) -> ControllerState {
        *self.state_rx.borrow()
    }

    pub fn stop_request(&self) -> StopRequest {
        *self.stop_tx.borrow()
    }

    /// Wait until the controller reaches [`ControllerState::Stopped`].
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state_rx.clone();
        let _ = state_rx
            .wait_for(|state| *state == ControllerState::Stopped)
            .await;
    }

    /// Receiver for session snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session_rx.clone()
    }
}

/// Drives the detect → repair → verify loop for one session.
pub struct LoopController {
    orchestrator: CycleOrchestrator,
    store: Arc<dyn SessionStore>,
    sink: Arc<dyn ReportSink>,
    health: HealthTracker,
    guard: EmergencyStopGuard,
    scheduler: AdaptiveScheduler,
    config: ControllerConfig,
    stop_tx: Arc<watch::Sender<StopRequest>>,
    stop_rx: watch::Receiver<StopRequest>,
    session_tx: watch::Sender<Session>,
    state_tx: watch::Sender<ControllerState>,
}

impl LoopController {
    pub fn new(
        orchestrator: CycleOrchestrator,
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(StopRequest::None);
        let (session_tx, _) = watch::channel(Session::new());
        let (state_tx, _) = watch::channel(ControllerState::Idle);
        Self {
            orchestrator,
            store,
            sink,
            health: HealthTracker::default(),
            guard: EmergencyStopGuard::new(GuardLimits::default()),
            scheduler: AdaptiveScheduler::default(),
            config: ControllerConfig::default(),
            stop_tx: Arc::new(stop_tx),
            stop_rx,
            session_tx,
            state_tx,
        }
    }

    #[must_use]
    pub fn with_health_tracker(mut self, health: HealthTracker) -> Self {
        self.health = health;
        self
    }

    #[must_use]
    pub fn with_guard(mut self, guard: EmergencyStopGuard) -> Self {
        self.guard = guard;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: AdaptiveScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            stop_tx: Arc::clone(&self.stop_tx),
            session_rx: self.session_tx.subscribe(),
            state_rx: self.state_tx.subscribe(),
        }
    }

    /// Run on a new task, returning a handle and the task.
    pub fn spawn(self) -> (ControllerHandle, JoinHandle<Result<RunSummary>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Run until the session stops.
    ///
    /// # Errors
    ///
    /// Returns an error only if the session could not be loaded. Every other
    /// fault ends in an orderly stop with [`StopReason::FatalInternalError`].
    pub async fn run(self) -> Result<RunSummary> {
        let mut session = match self.start_session() {
            Ok(session) => session,
            Err(e) => {
                self.state_tx.send_replace(ControllerState::Stopped);
                return Err(e);
            }
        };
        self.state_tx.send_replace(ControllerState::Running);

        session.running = true;
        session.stop_reason = None;
        let start_cycle = session.cycle;
        let mut save_failures = 0;
        if let Err(e) = self.persist(&mut session, &mut save_failures) {
            error!("{}", e);
        }
        self.publish(&session);

        info!(
            session_id = %session.id,
            resume_from = session.cycle,
            "Loop controller started"
        );

        let (emitter_stop_tx, emitter_stop_rx) = watch::channel(false);
        let emitter = ReportEmitter::new(Arc::clone(&self.sink), self.config.report_interval)
            .spawn(self.session_tx.subscribe(), emitter_stop_rx);

        let exit = match AssertUnwindSafe(self.drive(&mut session, start_cycle, &mut save_failures))
            .catch_unwind()
            .await
        {
            Ok(exit) => exit,
            Err(payload) => {
                error!("Loop body panicked: {}", panic_message(payload.as_ref()));
                Exit::Graceful(StopReason::FatalInternalError)
            }
        };

        let summary = self
            .shut_down(&mut session, exit, emitter_stop_tx, emitter, start_cycle)
            .await;
        Ok(summary)
    }

    fn start_session(&self) -> Result<Session> {
        match self.store.load()? {
            Some(session) if session.is_stopped() => {
                info!(
                    session_id = %session.id,
                    "Previous session already stopped; archiving it and starting fresh"
                );
                if let Err(e) = self.store.archive(&session) {
                    warn!("Failed to archive stopped session: {}", e);
                }
                Ok(Session::new())
            }
            Some(session) => {
                info!(session_id = %session.id, cycle = session.cycle, "Resuming session");
                Ok(session)
            }
            None => Ok(Session::new()),
        }
    }

    async fn drive(
        &self,
        session: &mut Session,
        start_cycle: u64,
        save_failures: &mut u32,
    ) -> Exit {
        let base = self.scheduler.config().base_interval;
        loop {
            match *self.stop_rx.borrow() {
                StopRequest::Force => return Exit::Forced,
                StopRequest::Graceful => return Exit::Graceful(StopReason::UserRequested),
                StopRequest::None => {}
            }

            if let Some((reason, detail)) = self.guard.tripped(&session.emergency) {
                warn!(reason = %reason, "Guard already tripped: {}", detail);
                return Exit::Graceful(reason);
            }

            if self.cycle_limit_reached(session, start_cycle) {
                return Exit::Graceful(StopReason::CycleLimitReached);
            }

            let mut force_rx = self.stop_rx.clone();
            let result = tokio::select! {
                result = self.orchestrator.run_cycle(session) => result,
                _ = force_rx.wait_for(|r| *r == StopRequest::Force) => {
                    warn!("In-flight cycle abandoned");
                    return Exit::Forced;
                }
            };

            let (verdict, delay) = match self.complete_cycle(session, result, base, save_failures) {
                Ok(next) => next,
                Err(e) => {
                    error!("Stopping on internal fault: {}", e);
                    return Exit::Graceful(StopReason::FatalInternalError);
                }
            };

            if let GuardVerdict::Stop { reason, .. } = verdict {
                return Exit::Graceful(reason);
            }
            if self.cycle_limit_reached(session, start_cycle) {
                return Exit::Graceful(StopReason::CycleLimitReached);
            }

            debug!(delay_ms = delay.as_millis() as u64, "Sleeping until next cycle");
            let mut wake_rx = self.stop_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wake_rx.wait_for(|r| *r != StopRequest::None) => {}
            }
        }
    }

    fn cycle_limit_reached(&self, session: &Session, start_cycle: u64) -> bool {
        match self.config.max_cycles {
            Some(max) if session.cycle - start_cycle >= max => {
                info!(cycles = max, "Cycle limit reached");
                true
            }
            _ => false,
        }
    }

    /// Fold a finished cycle into the session, then save and publish it.
    fn complete_cycle(
        &self,
        session: &mut Session,
        mut result: CycleResult,
        base: Duration,
        save_failures: &mut u32,
    ) -> Result<(GuardVerdict, Duration)> {
        let verdict = self.guard.evaluate(&mut session.emergency, &result);
        let delay = if verdict.should_stop() {
            Duration::ZERO
        } else {
            self.scheduler.next_delay(&result, base)
        };
        result.next_delay_ms = delay.as_millis() as u64;

        session.commit_cycle(result, self.config.history_limit)?;

        let health = self.health.update(session.history_slice());
        health.validate()?;
        session.health = health;

        let status = self
            .health
            .classify(&session.emergency, &self.guard, &session.health);
        if status != session.status {
            info!(from = %session.status, to = %status, "Session status changed");
            session.status = status;
        }

        let saved = self.persist(session, save_failures);
        self.publish(session);
        saved?;

        Ok((verdict, delay))
    }

    /// Save the session, tracking consecutive failures.
    ///
    /// A failed save is recorded on the session for the next report. Only
    /// reaching the configured number of consecutive failures is an error.
    fn persist(&self, session: &mut Session, save_failures: &mut u32) -> Result<()> {
        session.touch();
        match self.store.save(session) {
            Ok(()) => {
                *save_failures = 0;
                Ok(())
            }
            Err(e) => {
                *save_failures += 1;
                warn!(
                    consecutive = *save_failures,
                    "Failed to save session: {}", e
                );
                session.record_persistence_fault(e.to_string());
                if *save_failures >= self.config.max_consecutive_save_failures {
                    Err(MenderError::internal(format!(
                        "{} consecutive session save failures",
                        save_failures
                    )))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn publish(&self, session: &Session) {
        self.session_tx.send_replace(session.clone());
    }
}
