//! dbslice CLI - referentially consistent PostgreSQL subset copies.

use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use dbslice::{
    CopyScope, ExecutionReport, Orchestrator, Phase, Profile, RunFailure, RunOptions, SliceError,
    SwapDirection, RECONCILE_PHASES,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "dbslice")]
#[command(about = "Profile-driven, referentially consistent PostgreSQL subset copies")]
#[command(version)]
struct Cli {
    /// Path to YAML profile
    #[arg(short, long, default_value = "profile.yaml")]
    config: PathBuf,

    /// Dotenv file loaded before the profile (for the database URL variable)
    #[arg(long)]
    env: Option<PathBuf>,

    /// Print the report as JSON instead of YAML
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Override run.fanout_parallel
    #[arg(long)]
    fanout_parallel: Option<usize>,

    /// Override run.validate_parallel
    #[arg(long)]
    validate_parallel: Option<usize>,

    /// Leave foreign keys NOT VALID instead of validating them
    #[arg(long)]
    skip_validate_fk: bool,

    /// Seconds to wait for in-flight tasks after SIGINT/SIGTERM (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy the profile's selections and reconcile the destination schema
    Run {
        /// Drop and recreate the destination schema first
        #[arg(long)]
        restart: bool,

        /// Resolve selections and print the planned tasks without executing
        #[arg(long)]
        dry_run: bool,

        /// Copy only the precopy tables
        #[arg(long, conflicts_with = "families")]
        precopy_only: bool,

        /// Copy only these families (comma separated), without precopy
        #[arg(long, value_delimiter = ',')]
        families: Option<Vec<String>>,
    },

    /// Rerun reconcile phases against the current destination
    Reconcile {
        /// Phases to run, in order (comma separated, default: all)
        #[arg(long, value_delimiter = ',', value_parser = parse_phase)]
        phase: Option<Vec<Phase>>,

        /// Restrict to one table
        #[arg(long)]
        table: Option<String>,
    },

    /// Run only the redaction phase
    Neuter {
        /// Restrict to these destination tables (comma separated)
        #[arg(long, value_delimiter = ',')]
        tables: Option<Vec<String>>,
    },

    /// Drop the destination and staging tables of some families
    Reset {
        /// Families to reset (comma separated)
        #[arg(long, value_delimiter = ',', required = true)]
        families: Vec<String>,
    },

    /// Rename the source schema to old and the destination to the source name
    Swap,

    /// Undo a swap
    Unswap,

    /// Compare source and destination tables column by column
    Audit,

    /// Compare source and destination sequence definitions
    AuditSequences,

    /// Test the database connection
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SliceError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    if let Some(path) = &cli.env {
        dotenvy::from_path(path).map_err(|e| {
            SliceError::config(format!("cannot load env file {}: {}", path.display(), e))
        })?;
    }

    let profile = Profile::load(&cli.config)?;
    info!("Loaded profile from {:?}", cli.config);

    let cancel_token = setup_signal_handler();
    let mut orchestrator = Orchestrator::connect(profile)?
        .with_parallelism(cli.fanout_parallel, cli.validate_parallel)?
        .with_cancel(cancel_token.clone());
    if cli.skip_validate_fk {
        orchestrator = orchestrator.with_fk_validation(false);
    }
    let timeout = Duration::from_secs(cli.shutdown_timeout);
    let json = cli.output_json;

    match cli.command {
        Commands::Run {
            restart,
            dry_run,
            precopy_only,
            families,
        } => {
            let scope = match (precopy_only, families) {
                (true, _) => CopyScope::PrecopyOnly,
                (false, Some(families)) => CopyScope::Families(families.into_iter().collect()),
                (false, None) => CopyScope::All,
            };
            let options = RunOptions {
                dry_run,
                restart,
                scope,
            };
            let outcome = with_shutdown(orchestrator.run(options), &cancel_token, timeout).await?;
            emit_report(outcome, json)
        }

        Commands::Reconcile { phase, table } => {
            let phases = phase.unwrap_or_else(|| RECONCILE_PHASES.to_vec());
            let outcome = with_shutdown(
                orchestrator.reconcile(&phases, table.as_deref()),
                &cancel_token,
                timeout,
            )
            .await?;
            emit_report(outcome, json)
        }

        Commands::Neuter { tables } => {
            let outcome =
                with_shutdown(orchestrator.neuter(tables.as_deref()), &cancel_token, timeout)
                    .await?;
            emit_report(outcome, json)
        }

        Commands::Reset { families } => {
            let outcome =
                with_shutdown(orchestrator.reset(&families), &cancel_token, timeout).await?;
            emit_report(outcome, json)
        }

        Commands::Swap => emit_report(orchestrator.swap(SwapDirection::Swap).await, json),

        Commands::Unswap => emit_report(orchestrator.swap(SwapDirection::Unswap).await, json),

        Commands::Audit => {
            let report = orchestrator.audit().await?;
            print(&report, json)?;
            if !report.is_clean() {
                warn!(
                    "{} table(s) differ between {} and {}",
                    report.tables_with_differences, report.source_schema, report.dest_schema
                );
            }
            Ok(())
        }

        Commands::AuditSequences => {
            let report = orchestrator.audit_sequences().await?;
            print(&report, json)?;
            if !report.is_clean() {
                warn!(
                    "{} sequence(s) differ between {} and {}",
                    report.sequences_with_differences, report.source_schema, report.dest_schema
                );
            }
            Ok(())
        }

        Commands::HealthCheck => {
            let report = orchestrator.health_check().await;
            print(&report, json)?;
            if !report.healthy {
                return Err(SliceError::connection(
                    report.error.unwrap_or_else(|| "schema check failed".to_string()),
                    "health check",
                ));
            }
            Ok(())
        }
    }
}

fn parse_phase(s: &str) -> Result<Phase, String> {
    let phase: Phase = s.parse().map_err(|e: SliceError| e.to_string())?;
    if RECONCILE_PHASES.contains(&phase) {
        Ok(phase)
    } else {
        Err(format!("{} is not a reconcile phase", phase))
    }
}

/// Print the report whether or not the command succeeded, then surface the error.
fn emit_report(
    outcome: Result<ExecutionReport, RunFailure>,
    json: bool,
) -> Result<(), SliceError> {
    match outcome {
        Ok(report) => print(&report, json),
        Err(failure) => {
            print(&failure.report, json)?;
            Err(failure.error)
        }
    }
}

fn print<T: Serialize>(value: &T, json: bool) -> Result<(), SliceError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print!("{}", serde_yaml::to_string(value)?);
    }
    Ok(())
}

/// Await `command`, giving up `timeout` after cancellation if it has not drained.
async fn with_shutdown<F: Future>(
    command: F,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<F::Output, SliceError> {
    tokio::pin!(command);
    tokio::select! {
        output = &mut command => Ok(output),
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(timeout).await;
        } => {
            warn!("In-flight tasks did not finish within {}s", timeout.as_secs());
            Err(SliceError::Cancelled)
        }
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // stdout carries the report only.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT (Ctrl-C) or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Finishing in-flight tasks...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight tasks...");
            token.cancel();
        }
    });

    cancel_token
}
