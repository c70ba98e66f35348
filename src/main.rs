//! Mender - Continuous Detect-Repair-Verify Loop Controller
//!
//! Keeps a running web application healthy by detecting defects,
//! repairing them and verifying the result, cycle after cycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;

use mender::reporting::{write_report, AggregateReport, ReportKind};
use mender::session::signals::SignalListener;
use mender::session::{FileSessionStore, Session, SessionStatus, SessionStore};
use mender::{MenderError, MonitorConfig, RunSummary};

#[derive(Parser)]
#[command(name = "mender")]
#[command(version)]
#[command(about = "Continuous detect-repair-verify loop for web applications", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start (or resume) the monitoring loop
    Run {
        /// Target URL to monitor (repeatable; added to configured targets)
        #[arg(short, long = "target", value_name = "URL")]
        targets: Vec<String>,

        /// Base interval between cycles in seconds (min and max scale with it)
        #[arg(short, long, value_name = "SECS")]
        interval: Option<f64>,

        /// Stop after this many cycles
        #[arg(long, value_name = "N")]
        max_cycles: Option<u64>,

        /// Detect and verify only
        #[arg(long)]
        no_repair: bool,

        /// Skip verification
        #[arg(long)]
        no_verify: bool,

        /// Seconds between periodic reports
        #[arg(long, value_name = "SECS")]
        report_interval: Option<u64>,
    },

    /// Show the current (or most recent) session
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write an on-demand report for the current session
    Report {
        /// Also print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Archive the current session so the next run starts fresh
    Reset,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check the configuration without running
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "mender=debug,info"
    } else {
        "mender=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    // Resolve project path
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());

    if !project_path.exists() {
        eprintln!(
            "{} Project directory does not exist: {}",
            "Error:".red().bold(),
            project_path.display()
        );
        std::process::exit(1);
    }

    let config = match MonitorConfig::load(&project_path) {
        Ok(config) => config,
        Err(e) => fail(&e),
    };

    match cli.command {
        Commands::Run {
            targets,
            interval,
            max_cycles,
            no_repair,
            no_verify,
            report_interval,
        } => {
            let mut config = config
                .with_targets(targets)
                .with_max_cycles(max_cycles)
                .with_repair(!no_repair)
                .with_verification(!no_verify);
            if let Some(secs) = interval {
                if !(secs.is_finite() && secs > 0.0) {
                    fail(&MenderError::invalid_config(
                        "interval",
                        "must be a positive number of seconds",
                    ));
                }
                config = config.with_base_interval(Duration::from_secs_f64(secs));
            }
            if let Some(secs) = report_interval {
                config = config.with_report_interval(secs);
            }

            let controller = match config.build_controller(&project_path) {
                Ok(controller) => controller,
                Err(e) => fail(&e),
            };

            println!(
                "{} Monitoring {} target(s); state in {}",
                "Mender:".cyan().bold(),
                config.targets.len(),
                config.state_dir(&project_path).display()
            );

            let (handle, task) = controller.spawn();
            let listener = tokio::spawn(SignalListener::new(handle).listen());

            let summary = match task.await? {
                Ok(summary) => summary,
                Err(e) => fail(&e),
            };
            listener.abort();

            print_summary(&summary);
            std::process::exit(summary.exit_code());
        }

        Commands::Status { json } => {
            let store = config.build_store(&project_path);
            let Some(session) = current_or_archived(&store)? else {
                if json {
                    println!("null");
                } else {
                    println!("{} No session found", "Status:".cyan().bold());
                }
                return Ok(());
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
        }

        Commands::Report { json } => {
            let store = config.build_store(&project_path);
            let Some(session) = current_or_archived(&store)? else {
                eprintln!("{} No session to report on", "Error:".red().bold());
                std::process::exit(1);
            };

            let sink = config.build_sink(&project_path);
            let report = AggregateReport::from_session(&session, ReportKind::OnDemand);
            if !write_report(&sink, &report).await {
                eprintln!("{} Failed to write report", "Error:".red().bold());
                std::process::exit(1);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{} Report written to {}",
                    "OK".green().bold(),
                    sink.report_path(&report).display()
                );
            }
        }

        Commands::Reset => {
            let store = config.build_store(&project_path);
            match store.load()? {
                Some(session) => {
                    store.archive(&session)?;
                    println!(
                        "{} Session {} archived ({} cycles)",
                        "OK".green().bold(),
                        session.id,
                        session.cycle
                    );
                }
                None => println!("{} No active session", "Reset:".cyan().bold()),
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    print_config(&config, &project_path);
                }
            }
            ConfigAction::Validate => match config.validate() {
                Ok(()) => println!("{} Configuration is valid", "OK".green().bold()),
                Err(e) => fail(&e),
            },
        },
    }

    Ok(())
}

/// Print the error and exit with its code.
fn fail(err: &MenderError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), err);
    std::process::exit(err.exit_code());
}

fn current_or_archived(store: &FileSessionStore) -> mender::Result<Option<Session>> {
    match store.peek()? {
        Some(session) => Ok(Some(session)),
        None => store.latest_archived(),
    }
}

fn colored_status(status: SessionStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        SessionStatus::Healthy => label.green().bold(),
        SessionStatus::Warning => label.yellow().bold(),
        SessionStatus::Critical => label.red().bold(),
        SessionStatus::Stopped => label.dimmed(),
    }
}

fn print_summary(summary: &RunSummary) {
    println!("\n{} Loop Stopped", "Summary:".cyan().bold());
    println!("{}", "─".repeat(40));
    println!("   Session:        {}", summary.session_id);
    println!("   Reason:         {}", summary.stop_reason);
    println!("   Cycles (run):   {}", summary.cycles_completed);
    println!("   Last cycle:     {}", summary.last_cycle);
    println!("   Final status:   {}", colored_status(summary.final_status));
    if summary.forced {
        println!("   {}", "Forced stop: cleanup skipped".yellow());
    }
}

fn print_session(session: &Session) {
    let totals = &session.totals;
    println!("\n{} Session {}", "Status:".cyan().bold(), session.id);
    println!("{}", "─".repeat(40));
    println!("   Status:             {}", colored_status(session.status));
    println!("   Running:            {}", if session.running { "yes" } else { "no" });
    if let Some(reason) = session.stop_reason {
        println!("   Stop reason:        {}", reason);
    }
    println!("   Started:            {}", session.started_at.to_rfc3339());
    println!("   Cycles:             {}", session.cycle);
    println!(
        "   Last successful:    {}",
        session
            .last_successful_cycle
            .map_or_else(|| "never".to_string(), |c| c.to_string())
    );
    println!(
        "   Consecutive fails:  {}",
        session.emergency.consecutive_failures
    );
    println!();
    println!("   Errors detected:    {}", totals.errors_detected);
    println!(
        "   Repairs applied:    {}/{}",
        totals.repairs_applied, totals.repairs_attempted
    );
    println!(
        "   Verifications:      {}/{}",
        totals.verifications_passed, totals.verifications_run
    );
    println!(
        "   Cycle outcomes:     {} ok, {} warning, {} failed",
        totals.successful_cycles, totals.warning_cycles, totals.failed_cycles
    );
    println!();
    println!(
        "   Health ({} cycles): {:.2} errors/cycle, {:.2} repairs/cycle, {:.0}% verified",
        session.health.samples,
        session.health.error_rate,
        session.health.repair_rate,
        session.health.verification_rate * 100.0
    );
    if !session.persistence_faults.is_empty() {
        println!(
            "   {}",
            format!("{} persistence fault(s) recorded", session.persistence_faults.len()).yellow()
        );
    }
}

fn print_config(config: &MonitorConfig, project_path: &Path) {
    println!("\n{} Monitor Configuration", "Config:".cyan().bold());
    println!("{}", "─".repeat(40));
    println!("   Targets:            {}", config.targets.len());
    for target in &config.targets {
        println!("     - {}", target);
    }
    println!(
        "   Base interval:      {:.1}s ({:.1}s - {:.1}s)",
        config.schedule.base_interval.as_secs_f64(),
        config.schedule.min_interval.as_secs_f64(),
        config.schedule.max_interval.as_secs_f64()
    );
    println!("   Detector:           {:?}", config.detector.kind);
    println!(
        "   Repair:             {} ({} strategies)",
        if config.repair.enabled { "enabled" } else { "disabled" },
        config.repair.strategies.len()
    );
    println!(
        "   Verification:       {} ({} checks)",
        if config.verification.enabled { "enabled" } else { "disabled" },
        config.verification.checks.len()
    );
    println!(
        "   Guard:              {} failures, {} attempts, {} repeats",
        config.guard.max_consecutive_failures,
        config.guard.max_repair_attempts,
        config.guard.repeated_defect_limit
    );
    println!("   State directory:    {}", config.state_dir(project_path).display());
}
