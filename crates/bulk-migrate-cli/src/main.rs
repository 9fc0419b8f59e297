//! bulk-migrate CLI - concurrent batch loading and expression verification.

use bulk_migrate::source::{load_csv, ColumnType, CsvOptions};
use bulk_migrate::verify::{verify_expressions, ExpressionDetail, PgExpressionBackend};
use bulk_migrate::{BatchWriter, Config, MigrateError, PgMutationWriter};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code when the run finished but rows were dropped or expressions failed.
const EXIT_DEGRADED: u8 = 3;

/// Upper bound on staging connections opened for expression checks.
const MAX_PROBE_CONNECTIONS: usize = 32;

#[derive(Parser)]
#[command(name = "bulk-migrate")]
#[command(about = "Concurrent batch loading and expression verification for PostgreSQL targets")]
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

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a CSV file into a target table through the batch writer
    ImportCsv {
        /// CSV file to load
        file: PathBuf,

        /// Target table name
        #[arg(long)]
        table: String,

        /// Field delimiter
        #[arg(long, default_value = ",")]
        delimiter: char,

        /// The file has no header row (requires --columns)
        #[arg(long)]
        no_header: bool,

        /// Comma-separated column names
        #[arg(long, value_delimiter = ',')]
        columns: Option<Vec<String>>,

        /// Column types as name=type, e.g. id=bigint,created=timestamp
        #[arg(long = "types", value_delimiter = ',')]
        column_types: Vec<String>,

        /// Field value to load as NULL
        #[arg(long)]
        null_marker: Option<String>,

        /// Override number of write workers
        #[arg(long)]
        workers: Option<usize>,

        /// Override batch size limit in bytes
        #[arg(long)]
        bytes_limit: Option<usize>,

        /// Override attempts per batch
        #[arg(long)]
        retry_limit: Option<u32>,

        /// Flush the open batch every N rows
        #[arg(long)]
        flush_every: Option<usize>,
    },

    /// Check generated expressions against a staging database
    VerifyExpressions {
        /// YAML or JSON file with a list of expressions
        file: PathBuf,

        /// Override maximum concurrent probes
        #[arg(long)]
        concurrency: Option<usize>,

        /// Stop at the first invalid expression
        #[arg(long)]
        fail_fast: bool,
    },

    /// Test the target database connection
    HealthCheck,

    /// Validate the configuration file and print the effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<u8, MigrateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| MigrateError::Config(e.to_string()))?;

    let mut config = Config::load(&cli.config)?.with_auto_tuning();
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::ImportCsv {
            file,
            table,
            delimiter,
            no_header,
            columns,
            column_types,
            null_marker,
            workers,
            bytes_limit,
            retry_limit,
            flush_every,
        } => {
            if let Some(w) = workers {
                config.writer.write_limit = Some(w);
                config.writer.queue_depth = Some(w * 2);
            }
            if let Some(limit) = bytes_limit {
                config.writer.bytes_limit = Some(limit);
            }
            if let Some(attempts) = retry_limit {
                config.writer.retry_limit = attempts;
            }
            config.validate()?;

            if !delimiter.is_ascii() {
                return Err(MigrateError::Config(format!(
                    "Delimiter must be a single ASCII character, got {:?}",
                    delimiter
                )));
            }
            let options = CsvOptions {
                delimiter: delimiter as u8,
                has_header: !no_header,
                columns,
                column_types: parse_column_types(&column_types)?,
                null_marker,
                flush_every,
            };

            let cancel_token = setup_signal_handler().await?;
            import_csv(&config, &file, &table, &options, cancel_token, cli.output_json).await
        }

        Commands::VerifyExpressions {
            file,
            concurrency,
            fail_fast,
        } => {
            if let Some(c) = concurrency {
                config.verify.concurrency = c;
            }
            if fail_fast {
                config.verify.continue_on_error = false;
            }
            config.validate()?;

            let details = read_expressions(&file)?;
            let cancel_token = setup_signal_handler().await?;

            let pool_size = config
                .target
                .max_connections
                .unwrap_or_else(|| config.verify.concurrency.min(MAX_PROBE_CONNECTIONS));
            let backend = Arc::new(PgExpressionBackend::connect(&config.target, pool_size).await?);

            let report = tokio::select! {
                report = verify_expressions(backend, details, &config.target.schema, &config.verify) => report,
                _ = cancel_token.cancelled() => return Err(MigrateError::Cancelled),
            };

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\nExpression verification:");
                println!("  Passed: {}", report.passed);
                println!("  Failed: {}", report.failed);
                if report.skipped > 0 {
                    println!("  Skipped: {}", report.skipped);
                }
                println!("  Duration: {:.2}s", report.duration_ms as f64 / 1000.0);
                for failure in report.failures() {
                    println!(
                        "  ✗ {} ({} on {}): {}",
                        failure.id,
                        failure.kind,
                        failure.table,
                        failure.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }

            Ok(if report.is_success() { 0 } else { EXIT_DEGRADED })
        }

        Commands::HealthCheck => {
            let result = match PgMutationWriter::connect(&config.target, 1).await {
                Ok(target) => target.health_check().await,
                Err(e) => Err(e),
            };

            let (connected, latency_ms, error) = match &result {
                Ok(latency) => (true, latency.as_millis() as u64, None),
                Err(e) => (false, 0, Some(e.to_string())),
            };

            if cli.output_json {
                let body = json!({
                    "target_connected": connected,
                    "target_latency_ms": latency_ms,
                    "target_error": error,
                    "healthy": connected,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Target (PostgreSQL): {} ({}ms)",
                    if connected { "OK" } else { "FAILED" },
                    latency_ms
                );
                if let Some(ref err) = error {
                    println!("    Error: {}", err);
                }
                println!("\n  Overall: {}", if connected { "HEALTHY" } else { "UNHEALTHY" });
            }

            result.map(|_| 0)
        }

        Commands::CheckConfig => {
            if !config.target.password.is_empty() {
                config.target.password = "********".to_string();
            }
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("Configuration OK\n");
                print!("{}", serde_yaml::to_string(&config)?);
            }
            Ok(0)
        }
    }
}

async fn import_csv(
    config: &Config,
    file: &Path,
    table: &str,
    options: &CsvOptions,
    cancel_token: CancellationToken,
    output_json: bool,
) -> Result<u8, MigrateError> {
    let reader = std::io::BufReader::new(std::fs::File::open(file)?);

    let workers = config.writer.get_write_limit();
    let target = PgMutationWriter::connect(&config.target, config.target.pool_size(workers)).await?;
    let mut writer = BatchWriter::new(config.writer.clone(), Arc::new(target))?;

    let loaded = load_csv(reader, table, options, &mut writer, &cancel_token).await;

    // Drain even when loading failed so in-flight batches are accounted for
    let stats = writer.drain().await?;
    let csv_stats = loaded?;

    if output_json {
        let body = json!({
            "table": table,
            "csv": csv_stats,
            "rows": stats,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("\nImport {}!", if csv_stats.cancelled { "cancelled" } else { "completed" });
        println!("  Table: {}", table);
        println!("  Rows read: {}", csv_stats.rows_read);
        println!("  Bad rows skipped: {}", csv_stats.bad_rows);
        println!("  Rows committed: {}", stats.committed);
        println!("  Batches: {} committed, {} dropped", stats.batches_committed, stats.batches_dropped);
        for line in stats.drop_summary() {
            println!("  ✗ {}", line);
        }
    }

    if csv_stats.cancelled {
        return Err(MigrateError::Cancelled);
    }
    if stats.total_dropped() > 0 || csv_stats.bad_rows > 0 {
        warn!(
            "{} rows dropped and {} bad rows skipped while loading {}",
            stats.total_dropped(),
            csv_stats.bad_rows,
            table
        );
        return Ok(EXIT_DEGRADED);
    }
    Ok(0)
}

/// Parse `name=type` pairs from the command line.
fn parse_column_types(pairs: &[String]) -> Result<HashMap<String, ColumnType>, MigrateError> {
    pairs
        .iter()
        .map(|pair| {
            let (name, ty) = pair.split_once('=').ok_or_else(|| {
                MigrateError::Config(format!("Expected name=type, got '{}'", pair))
            })?;
            Ok((name.trim().to_string(), ty.trim().parse::<ColumnType>()?))
        })
        .collect()
}

/// Read expression details from YAML, or JSON when the file ends in `.json`.
fn read_expressions(path: &Path) -> Result<Vec<ExpressionDetail>, MigrateError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let details: Vec<ExpressionDetail> = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    info!("Read {} expressions from {:?}", details.len(), path);
    Ok(details)
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --output-json stays machine-readable
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

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Finishing in-flight batches...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Finishing in-flight batches...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, MigrateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight batches...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
