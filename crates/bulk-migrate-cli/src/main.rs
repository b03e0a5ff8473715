//! bulk-migrate CLI - resumable bulk transfers into Elasticsearch.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use bulk_migrate::error::EXIT_CANCELLED;
use bulk_migrate::{
    Config, JsonProgressObserver, LoggingObserver, MigrateError, Orchestrator, OutcomeFilter,
    ProgressObserver, Summary, TerminalState,
};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "bulk-migrate")]
#[command(about = "Resumable bulk transfer of keyed records into Elasticsearch")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Seconds to let in-flight batches drain after a shutdown signal before
    /// aborting them; aborted batches are re-read on resume
    /// [default: write attempts x store timeout, plus backoff and commit]
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Print progress updates as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a fresh transfer from the beginning of the source
    Run {
        /// Override records per page
        #[arg(long)]
        page_size: Option<usize>,

        /// Override number of batches written concurrently
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Continue from the stored checkpoint
    Resume {
        /// Override records per page
        #[arg(long)]
        page_size: Option<usize>,

        /// Override number of batches written concurrently
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Clear the stored checkpoint so the next run re-scans everything
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Show the stored checkpoint
    Status,

    /// List failed batches recorded in the event log
    Failures {
        /// Only show failures from this run
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Check that the source, destination and checkpoint stores answer
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let mut config = Config::load(&cli.config)?;
    match &cli.command {
        Commands::Run {
            page_size,
            concurrency,
        }
        | Commands::Resume {
            page_size,
            concurrency,
        } => {
            if page_size.is_some() {
                config.source.page_size = *page_size;
            }
            if concurrency.is_some() {
                config.transfer.concurrency = *concurrency;
            }
            config.validate()?;
        }
        _ => {}
    }
    let config = config.with_auto_tuning();
    info!(
        "Loaded configuration from {:?} (hash {})",
        cli.config,
        &config.hash()[..12]
    );

    let mut orchestrator = Orchestrator::from_config(&config)?;
    let resume = matches!(cli.command, Commands::Resume { .. });

    match cli.command {
        Commands::Run { .. } | Commands::Resume { .. } => {
            let observer: Arc<dyn ProgressObserver> = if cli.progress {
                Arc::new(JsonProgressObserver::stderr())
            } else {
                Arc::new(LoggingObserver)
            };
            orchestrator = orchestrator.with_observer(observer);

            let shutdown_timeout = cli
                .shutdown_timeout
                .unwrap_or_else(|| config.transfer.drain_timeout_secs());

            // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
            let cancel_token = setup_signal_handler(shutdown_timeout)?;

            let summary = run_until_drained(
                &orchestrator,
                resume,
                cancel_token,
                Duration::from_secs(shutdown_timeout),
            )
            .await?;

            if cli.output_json {
                println!("{}", summary.to_json()?);
            } else {
                print_summary(&summary);
            }

            Ok(match (&summary.terminal_state, &summary.failure) {
                (TerminalState::Completed, _) => ExitCode::SUCCESS,
                (TerminalState::Cancelled, _) => ExitCode::from(EXIT_CANCELLED),
                (TerminalState::Failed, Some(failure)) => ExitCode::from(failure.exit_code()),
                (TerminalState::Failed, None) => ExitCode::FAILURE,
            })
        }

        Commands::Reset { yes } => {
            if !yes {
                return Err(MigrateError::Config(
                    "reset discards the checkpoint; pass --yes to confirm".to_string(),
                ));
            }
            orchestrator.reset().await?;
            println!("Checkpoint cleared for {}", config.transfer.id);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status => {
            let record = orchestrator.status().await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                match record {
                    None => println!("No checkpoint for {}", config.transfer.id),
                    Some(r) => {
                        println!("Transfer: {}", r.transfer_id);
                        println!("  Status: {}", r.status);
                        println!("  Run ID: {}", r.run_id);
                        println!("  Position: {}", r.position);
                        println!("  Batches committed: {}", r.batch_seq);
                        println!("  Records: {}", r.records_total);
                        println!("  Started: {}", r.started_at);
                        println!("  Updated: {}", r.updated_at);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Failures { run_id } => {
            let mut filter = OutcomeFilter::failures();
            if let Some(run_id) = run_id {
                filter = filter.for_run(run_id);
            }
            let failures: Vec<_> = orchestrator.outcomes(filter).try_collect().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&failures)?);
            } else if failures.is_empty() {
                println!("No failed batches recorded for {}", config.transfer.id);
            } else {
                println!("Failed batches for {}:", config.transfer.id);
                for f in &failures {
                    println!(
                        "  batch {} ({} records, {} attempts) run {} at {}",
                        f.batch_seq, f.records, f.attempts, f.run_id, f.timestamp
                    );
                    println!("    from: {}", f.start_position);
                    if let Some(ref err) = f.error {
                        println!("    error: {}", err);
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::HealthCheck => {
            orchestrator.health_check().await?;
            if cli.output_json {
                println!("{}", serde_json::json!({ "healthy": true }));
            } else {
                println!("Health Check: HEALTHY");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Run the transfer. Once `cancel` fires, in-flight batches get
/// `shutdown_timeout` to drain. After that the run is dropped mid-write; the
/// checkpoint still points before those batches, so resume re-reads them.
async fn run_until_drained(
    orchestrator: &Orchestrator,
    resume: bool,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
) -> Result<Summary, MigrateError> {
    let watchdog = cancel.clone();
    tokio::select! {
        result = orchestrator.run(resume, cancel) => result,
        _ = async {
            watchdog.cancelled().await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!(
                "In-flight batches did not drain within {:?}; aborting them, resume will re-read them from the last checkpoint",
                shutdown_timeout
            );
            Err(MigrateError::Cancelled)
        }
    }
}

fn print_summary(summary: &Summary) {
    let headline = match summary.terminal_state {
        TerminalState::Completed => "Transfer completed!",
        TerminalState::Cancelled => "Transfer cancelled.",
        TerminalState::Failed => "Transfer failed.",
    };
    println!("\n{}", headline);
    println!("  Transfer: {}", summary.transfer_id);
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.elapsed_seconds);
    println!("  Batches: {}", summary.batches);
    println!(
        "  Records: {} this run, {} total",
        summary.run_records, summary.total_records
    );
    println!("  Throughput: {:.0} records/sec", summary.records_per_second);
    println!("  Checkpoint: {}", summary.checkpoint);
    if let Some(ref failure) = summary.failure {
        println!(
            "  Failed batch: {} ({:?}): {}",
            failure.batch_seq, failure.stage, failure.cause
        );
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

    // Logs go to stderr so --output-json leaves stdout clean.
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

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (container shutdown).
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Finishing in-flight batches (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Finishing in-flight batches (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    Ok(cancel_token)
}
