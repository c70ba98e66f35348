//! The stopping path.
//!
//! Graceful: final report, close collaborators, save, archive. Forced: one
//! save and nothing else. A force stop that arrives while a graceful
//! shutdown is still cleaning up cuts the cleanup short; the save still
//! happens but the session is not archived.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{ControllerState, LoopController, RunSummary, StopRequest};
use crate::reporting::{write_report, AggregateReport, ReportKind};
use crate::session::{Session, SessionStatus, StopReason};

/// How long to wait for the report emitter to finish its current write.
const EMITTER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the loop body returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exit {
    Graceful(StopReason),
    Forced,
}

impl LoopController {
    pub(crate) async fn shut_down(
        &self,
        session: &mut Session,
        exit: Exit,
        emitter_stop: watch::Sender<bool>,
        mut emitter: JoinHandle<u32>,
        start_cycle: u64,
    ) -> RunSummary {
        self.state_tx.send_replace(ControllerState::Stopping);
        let final_status = session.status;

        let _ = emitter_stop.send(true);
        let mut forced = exit == Exit::Forced;
        let stop_reason = match exit {
            Exit::Graceful(reason) => reason,
            Exit::Forced => StopReason::UserRequested,
        };
        session.stop_reason = Some(stop_reason);

        info!(
            session_id = %session.id,
            reason = %stop_reason,
            forced,
            "Loop controller stopping"
        );

        if !forced {
            let mut force_rx = self.stop_rx.clone();
            tokio::select! {
                _ = self.clean_up(session, &mut emitter) => {}
                _ = force_rx.wait_for(|r| *r == StopRequest::Force) => {
                    warn!("Force stop during shutdown; skipping remaining cleanup");
                    forced = true;
                }
            }
        }
        // No report may land after the final one or after the sink closed.
        emitter.abort();

        session.running = false;
        session.status = SessionStatus::Stopped;
        session.touch();
        if let Err(e) = self.store.save(session) {
            error!("Failed to save session during shutdown: {}", e);
            session.record_persistence_fault(e.to_string());
        }
        if !forced {
            if let Err(e) = self.store.archive(session) {
                error!("Failed to archive session: {}", e);
            }
        }

        self.publish(session);
        self.state_tx.send_replace(ControllerState::Stopped);

        info!(
            session_id = %session.id,
            reason = %stop_reason,
            cycles = session.cycle - start_cycle,
            "Loop controller stopped"
        );

        RunSummary {
            session_id: session.id.clone(),
            stop_reason,
            cycles_completed: session.cycle - start_cycle,
            last_cycle: session.cycle,
            final_status,
            forced,
        }
    }

    /// Final report, then release the collaborators and the sink.
    ///
    /// An emitter still writing after [`EMITTER_JOIN_TIMEOUT`] is aborted and
    /// reaped before the final report goes out.
    async fn clean_up(&self, session: &Session, emitter: &mut JoinHandle<u32>) {
        match tokio::time::timeout(EMITTER_JOIN_TIMEOUT, &mut *emitter).await {
            Ok(Ok(written)) => info!(written, "Report emitter finished"),
            Ok(Err(e)) => warn!("Report emitter task failed: {}", e),
            Err(_) => {
                warn!("Report emitter did not finish in time; aborting it");
                emitter.abort();
                let _ = (&mut *emitter).await;
            }
        }

        let report = AggregateReport::from_session(session, ReportKind::Final);
        write_report(self.sink.as_ref(), &report).await;

        self.orchestrator.close_all().await;
        if let Err(e) = self.sink.close().await {
            warn!("Failed to close report sink: {:#}", e);
        }
    }
}
