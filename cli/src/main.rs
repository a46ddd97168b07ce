//! CLI entrypoint for techsage
//!
//! This is the main binary that wires together all layers using
//! dependency injection.

use anyhow::{Context, Result};
use clap::Parser;
use sage_application::{AskService, ServiceConfig};
use sage_infrastructure::{
    ConfigLoader, FileTechnologyCatalog, JsonlQueryLogger, ProcessAgentGateway,
};
use sage_presentation::{ChatRepl, Cli, Commands, ConsoleFormatter, OutputFormat, StreamRenderer};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let filter = match cli.verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"), // -vvv or more
    };

    // The guard flushes buffered log lines when dropped.
    let log_guard = match &cli.log_file {
        Some(path) => {
            let (writer, guard) = file_log_writer(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    };

    // Load configuration
    let file_config = if cli.no_config {
        ConfigLoader::load_defaults()
    } else {
        ConfigLoader::load(cli.config.as_ref()).context("failed to load configuration")?
    };
    file_config.validate()?;

    let mut service_config = file_config.service_config();
    if matches!(&cli.command, Commands::Ask { no_cache: true, .. }) {
        service_config.cache.enabled = false;
    }

    info!("starting techsage");

    // === Dependency Injection ===
    let gateway = Arc::new(
        ProcessAgentGateway::with_command(file_config.agent.command.clone())
            .with_ready_timeout(file_config.agent.ready_timeout()),
    );
    let catalog = Arc::new(FileTechnologyCatalog::new(file_config.technology_entries()));
    let mut service = AskService::new(gateway, catalog, service_config.clone());
    if let Some(path) = &file_config.log.query_log
        && let Some(logger) = JsonlQueryLogger::new(path)
    {
        service = service.with_query_logger(Arc::new(logger));
    }
    let service = Arc::new(service);

    let result = match &cli.command {
        Commands::Ask {
            technology,
            question,
            output,
            ..
        } => run_ask(&service, &service_config, technology, question, *output, cli.quiet).await,
        Commands::List => {
            println!(
                "{}",
                ConsoleFormatter::format_technologies(&service.list_technologies())
            );
            Ok(true)
        }
        Commands::Chat { technology } => {
            let repl = ChatRepl::new(Arc::clone(&service), technology.clone())
                .with_backpressure(service_config.backpressure.clone())
                .with_quiet(cli.quiet);
            repl.run().await.map(|()| true).map_err(anyhow::Error::from)
        }
        Commands::Metrics => {
            println!("{}", ConsoleFormatter::format_metrics(&service.metrics()));
            Ok(true)
        }
    };

    // Instances hold spawned agent processes; tear them down before exit.
    service.shutdown().await;

    match result {
        Ok(true) => Ok(()),
        Ok(false) => {
            drop(log_guard);
            std::process::exit(1);
        }
        Err(e) => Err(e),
    }
}

/// One-shot ask. Returns Ok(false) when the session reported a failure
/// that the renderer already displayed, so the process can exit nonzero
/// without printing it twice.
async fn run_ask(
    service: &Arc<AskService>,
    config: &ServiceConfig,
    technology: &str,
    question: &str,
    output: OutputFormat,
    quiet: bool,
) -> Result<bool> {
    let before = service.metrics();
    let started = Instant::now();
    let stream = service.ask_question(technology, question).await?;

    let renderer = match output {
        OutputFormat::Full => StreamRenderer::new(config.backpressure.clone())
            .with_spinner(!quiet)
            .with_status(!quiet),
        OutputFormat::Answer => StreamRenderer::new(config.backpressure.clone())
            .with_spinner(!quiet)
            .with_status(false)
            .with_echo(false),
        OutputFormat::Json => StreamRenderer::new(config.backpressure.clone())
            .with_spinner(!quiet)
            .with_status(false)
            .with_echo(false),
    };
    let rendered = renderer.render(stream).await;
    let after = service.metrics();
    let report = rendered.into_report(
        technology,
        question,
        started.elapsed().as_millis() as u64,
        after.cache.hits > before.cache.hits,
        after.session_pool.reused_total > before.session_pool.reused_total,
    );

    match output {
        OutputFormat::Full => {
            // The renderer already echoed the text and any error.
            if !quiet && report.error.is_none() {
                eprintln!("{}", ConsoleFormatter::format_summary(&report));
            }
        }
        OutputFormat::Answer => match &report.error {
            Some(message) => eprintln!("{}", ConsoleFormatter::error_line(message)),
            None => print!("{}", ConsoleFormatter::format_answer(&report)),
        },
        OutputFormat::Json => {
            if let Some(message) = &report.error {
                eprintln!("{}", ConsoleFormatter::error_line(message));
            }
            println!("{}", ConsoleFormatter::format_json(&report));
        }
    }

    Ok(report.error.is_none())
}

/// Opens the log file for appending behind a non-blocking writer.
fn file_log_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}
