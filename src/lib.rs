//! Mender - Continuous Detect-Repair-Verify Loop Controller
//!
//! Watches a running web application, detects defects, attempts automated
//! repairs, verifies the result and keeps going until told to stop or until
//! the emergency-stop guard decides the loop is doing more harm than good.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`collaborators`] - Detector, repairer, verifier and report sink traits plus built-in implementations
//! - [`config`] - Configuration loading, validation and controller assembly
//! - [`controller`] - The loop controller, its handle and the shutdown path
//! - [`cycle`] - One detect-repair-verify pass and its result record
//! - [`error`] - Custom error types and handling
//! - [`health`] - Rolling health metrics and status classification
//! - [`reporting`] - Aggregate reports and the periodic emitter
//! - [`scheduler`] - Adaptive inter-cycle delay
//! - [`session`] - Session state, atomic persistence and signal handling
//! - [`supervisor`] - Emergency-stop guard and defect signatures
//! - [`testing`] - Testing infrastructure (mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::config::MonitorConfig;
//! use mender::session::signals::SignalListener;
//!
//! let config = MonitorConfig::load(".")?.with_targets(vec!["http://localhost:3000".into()]);
//! let controller = config.build_controller(".")?;
//!
//! let (handle, task) = controller.spawn();
//! tokio::spawn(SignalListener::new(handle).listen());
//! let summary = task.await??;
//! std::process::exit(summary.exit_code());
//! ```

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod cycle;
pub mod error;
pub mod health;
pub mod reporting;
pub mod scheduler;
pub mod session;
pub mod supervisor;
pub mod testing;

// Re-export commonly used types
pub use error::{IntoMenderError, MenderError, Result};

pub use config::MonitorConfig;

pub use collaborators::{
    Defect, DefectCategory, Detector, RepairReport, Repairer, ReportSink, Severity,
    VerificationReport, Verifier,
};

pub use controller::{
    ControllerConfig, ControllerHandle, ControllerState, LoopController, RunSummary, StopRequest,
};

pub use cycle::{CycleOrchestrator, CycleOutcome, CycleResult, OrchestratorConfig};

pub use health::{HealthSnapshot, HealthTracker};

pub use reporting::{AggregateReport, JsonReportSink, ReportEmitter, ReportKind};

pub use scheduler::{AdaptiveScheduler, SchedulerConfig};

pub use session::{FileSessionStore, Session, SessionStatus, SessionStore, StopReason};

pub use supervisor::{EmergencyState, EmergencyStopGuard, GuardLimits, GuardVerdict, SignatureMode};
