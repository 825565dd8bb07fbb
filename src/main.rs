// ABOUTME: opera entry point: reads inbound chat events as JSON lines on stdin and orchestrates them.
// ABOUTME: Outbound messages go to stdout as JSON lines; logs go to stderr and optional files.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opera::{classifier_registry, logging, JsonLineTransport, SqliteDirectory};
use opera_core::traits::Directory;
use opera_core::{Config, InboundEvent, Manager};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "opera", about = "Dialogue orchestration: pool, classify and route chat events", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print Prometheus metrics to stderr on shutdown
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process events from stdin until EOF or Ctrl-C (default)
    Run {
        /// Run without the SQLite directory; task state is not persisted
        #[arg(long)]
        no_directory: bool,
    },
    /// Load and validate the configuration, then print it with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let (config, source) = Config::load_with_source()?;
    let _log_guard = logging::init(&config.logging, &cli.log_level)?;
    match &source {
        Some(path) => tracing::info!(path = %path.display(), "Loaded config"),
        None => tracing::info!("No config file found, using defaults"),
    }
    if let Some(dir) = config.logging.file_directory() {
        tracing::info!(dir = %dir.display(), "Writing log files");
    }

    let metrics_handle = if cli.metrics {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("installing metrics recorder")?,
        )
    } else {
        None
    };

    match cli.command.unwrap_or(Commands::Run { no_directory: false }) {
        Commands::CheckConfig => {
            // Debug output redacts classifier secrets
            println!("{:#?}", config);
            tracing::info!(
                classifier = %config.classifier.classifier_type(),
                workers = config.workers.len(),
                "Configuration is valid"
            );
            Ok(())
        }
        Commands::Run { no_directory } => {
            let result = run(config, no_directory).await;
            if let Some(handle) = metrics_handle {
                dump_metrics(&handle);
            }
            result
        }
    }
}

// =============================================================================
// Event loop
// =============================================================================

async fn run(config: Config, no_directory: bool) -> Result<()> {
    let classifier = classifier_registry(&config.retry).create_from_config(&config.classifier)?;
    tracing::info!(classifier = classifier.name(), "Classifier ready");

    let directory: Option<Arc<dyn Directory>> = if no_directory {
        None
    } else {
        let dir = SqliteDirectory::open(&config.directory.path)?;
        tracing::info!(path = %config.directory.path, "Directory opened");
        Some(Arc::new(dir))
    };

    let transport = Arc::new(JsonLineTransport::stdout());
    let manager = Manager::new(&config, classifier, transport, directory);
    if let Err(e) = manager.restore_workers().await {
        tracing::warn!(error = %format!("{e:#}"), "Could not restore worker registry");
    }
    let maintenance = manager.spawn_maintenance();

    tracing::info!(
        max_pool = config.pool.max_size,
        workers = config.workers.len(),
        "opera started, reading events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    tracing::info!("stdin closed, shutting down");
                    break;
                };
                handle_line(&manager, &line).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }
    }

    maintenance.abort();
    manager.flush().await;
    let pool = manager.pool().lock().await;
    tracing::info!(
        pooled = pool.len(),
        tasks = manager.queue().len(),
        "Final state"
    );
    Ok(())
}

async fn handle_line(manager: &Manager, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let event: InboundEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed event line");
            return;
        }
    };

    let (scope_id, index) = (event.scope_id.clone(), event.index);
    match manager.ingest(event).await {
        Ok(report) => tracing::info!(
            scope_id = %scope_id,
            index,
            accepted = report.accepted,
            tasks = report.tasks.len(),
            dispatched = report.dispatched,
            unrouted = report.unrouted.len(),
            "Event processed"
        ),
        Err(e) => tracing::error!(scope_id = %scope_id, index, error = %format!("{e:#}"), "Event failed"),
    }
}

fn dump_metrics(handle: &PrometheusHandle) {
    eprintln!("{}", handle.render());
}
