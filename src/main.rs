use std::io::Write;
use std::process;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, bail};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use xml_tag_audit::aggregator::BatchResultSet;
use xml_tag_audit::cli::{Cli, OutputFormat, VerbosityLevel};
use xml_tag_audit::config::{Config, ConfigManager};
use xml_tag_audit::error::{AuditError, IntakeError};
use xml_tag_audit::error_reporter::ErrorReporter;
use xml_tag_audit::export::{CsvExporter, ExportKind, suggested_export_directories};
use xml_tag_audit::libxml2::LibXml2Wrapper;
use xml_tag_audit::output::Output;
use xml_tag_audit::progress::BatchEvent;
use xml_tag_audit::scheduler::BatchScheduler;
use xml_tag_audit::session::SessionStore;
use xml_tag_audit::validator::{FileRef, FileValidator};

const EXIT_SUCCESS: i32 = 0;
const EXIT_BATCH_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if let Err(message) = cli.validate() {
        eprintln!("Error: {}", message);
        process::exit(EXIT_USAGE);
    }

    let config = match ConfigManager::load_config(&cli).await {
        Ok(config) => config,
        Err(e) => {
            init_tracing(cli.verbosity());
            ErrorReporter::new(cli.verbosity()).report_error(&AuditError::from(e));
            process::exit(EXIT_USAGE);
        }
    };
    init_tracing(ConfigManager::get_verbosity(&config, cli.verbose));

    match run(&cli, &config).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "audit aborted");
            eprintln!("Error: {:#}", e);
            process::exit(EXIT_BATCH_FAILURE);
        }
    }
}

/// `RUST_LOG` wins over the level picked from `-v`/`-q`
fn init_tracing(verbosity: VerbosityLevel) {
    let default_level = match verbosity {
        VerbosityLevel::Quiet => "error",
        VerbosityLevel::Normal => "warn",
        VerbosityLevel::Verbose => "info",
        VerbosityLevel::Debug => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: &Cli, config: &Config) -> Result<i32> {
    let verbosity = ConfigManager::get_verbosity(config, cli.verbose);
    let reporter = ErrorReporter::with_timestamps(verbosity, verbosity == VerbosityLevel::Debug);

    let files = match collect_files(cli, config).await {
        Ok(files) => files,
        Err(e) => {
            if cli.events {
                emit(&BatchEvent::failed(&e))?;
            }
            error!(error = %e, "batch rejected");
            reporter.report_error(&AuditError::from(e));
            return Ok(EXIT_BATCH_FAILURE);
        }
    };

    let validator = FileValidator::with_parser(
        ConfigManager::tag_schema(config),
        LibXml2Wrapper::with_recovery(config.processing.recover),
    );
    let scheduler = BatchScheduler::new(validator, ConfigManager::scheduler_config(config));

    let sessions = SessionStore::new();
    let session = sessions.create().await;

    let show_progress = !cli.events
        && verbosity != VerbosityLevel::Quiet
        && (cli.progress || atty::is(atty::Stream::Stderr));

    let started = Instant::now();
    let mut channel = scheduler.run(files);
    let mut completed: Option<Arc<BatchResultSet>> = None;

    while let Some(event) = channel.recv().await {
        if cli.events {
            emit(&event)?;
        }
        match event {
            BatchEvent::Progress(update) => {
                if show_progress {
                    reporter.report_progress(&update);
                }
            }
            BatchEvent::Complete(results) => {
                completed = Some(results);
                break;
            }
            BatchEvent::Failed(failure) => {
                error!(error = %failure.error, "batch failed");
                eprintln!("Error: {}", failure.error);
                return Ok(EXIT_BATCH_FAILURE);
            }
        }
    }

    let Some(results) = completed else {
        bail!("batch ended without a completion event");
    };
    let elapsed = started.elapsed();
    sessions.record_batch(session, Arc::clone(&results)).await?;

    if !cli.events {
        let output = Output::new(verbosity);
        match OutputFormat::from(config.output.format) {
            OutputFormat::Human => print!("{}", output.format_results(&results, elapsed)),
            OutputFormat::Json => println!("{}", output.format_json(&results, elapsed)),
        }
    }

    if cli.export.is_empty() {
        return Ok(EXIT_SUCCESS);
    }

    let exporter = CsvExporter::new(ConfigManager::get_export_directory(config));
    debug!(
        candidates = ?suggested_export_directories(exporter.directory()),
        "export directories"
    );

    let mut exit_code = EXIT_SUCCESS;
    let mut requested: Vec<ExportKind> = Vec::with_capacity(cli.export.len());
    for kind in &cli.export {
        if !requested.contains(kind) {
            requested.push(*kind);
        }
    }
    for kind in requested {
        match sessions.export(session, &exporter, kind).await {
            Ok(path) => {
                info!(kind = %kind, path = %path.display(), "exported");
                if verbosity != VerbosityLevel::Quiet && !cli.events {
                    println!("Exported {} files to {}", kind, path.display());
                }
            }
            Err(e) => {
                reporter.report_error(&e);
                exit_code = EXIT_BATCH_FAILURE;
            }
        }
    }

    Ok(exit_code)
}

async fn collect_files(
    cli: &Cli,
    config: &Config,
) -> std::result::Result<Vec<FileRef>, IntakeError> {
    let intake = ConfigManager::upload_intake(config);
    match (&cli.manifest, &cli.path) {
        (Some(manifest), _) => intake.from_manifest(manifest).await,
        (None, Some(path)) => intake.discover(path).await,
        (None, None) => Err(IntakeError::NoFiles),
    }
}

fn emit(event: &BatchEvent) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(event.to_sse_frame().as_bytes())?;
    stdout.flush()?;
    Ok(())
}
