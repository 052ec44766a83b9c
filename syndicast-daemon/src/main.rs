//! syndicast-daemon - Long-running dispatch daemon
//!
//! Starts the dispatch engine, recovers pending work from the database and
//! keeps publishing until it receives SIGINT or SIGTERM.

use anyhow::Context;
use clap::Parser;
use libsyndicast::engine::{SubmitOutcome, SubmitRequest};
use libsyndicast::logging::{LogFormat, LoggingConfig};
use libsyndicast::{Config, DispatchEngine, SyndicastError};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "syndicast-daemon")]
#[command(version)]
#[command(about = "Dispatch daemon for multi-platform publishing")]
#[command(long_about = "\
syndicast-daemon - Dispatch daemon for multi-platform publishing

DESCRIPTION:
    syndicast-daemon runs the Syndicast dispatch engine. On start it loads
    platform health and open alerts from the database, re-arms scheduled
    and retrying tasks, and resumes analytics sampling for recent posts.

    With --stdin, every input line is a JSON submit request and one JSON
    outcome is written to stdout per line. Logs always go to stderr.

USAGE:
    # Run in foreground
    syndicast-daemon

    # Submit tasks from another process
    producer | syndicast-daemon --stdin

    # Start paused; nothing is published until maintenance is lifted
    syndicast-daemon --maintenance

REQUEST FORMAT:
    {\"platform\": \"blog\", \"payload\": {\"title\": \"Hi\", \"body\": \"...\"},
     \"scheduled_at\": 1767225600, \"max_attempts\": 5, \"priority\": \"high\"}

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (waits for in-flight publishes)

CONFIGURATION:
    Configuration file: ~/.config/syndicast/config.toml
    Override with SYNDICAST_CONFIG or --config.

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Configuration file (overrides SYNDICAST_CONFIG)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log format: text, json or pretty
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Start with execution paused
    #[arg(long)]
    maintenance: bool,

    /// Read JSON submit requests from stdin, one per line
    #[arg(long)]
    stdin: bool,

    /// Stop after startup (or after stdin closes with --stdin)
    #[arg(long, hide = true)]
    once: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<SyndicastError>()
            .map_or(1, SyndicastError::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    // Log with defaults if the configuration itself is broken
    let section = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    let mut logging = LoggingConfig::from_section(&section, cli.verbose);
    if let Some(format) = cli.log_format {
        logging.format = format;
    }
    if let Err(e) = logging.try_init() {
        eprintln!("Warning: {}", e);
    }

    let config = loaded?;
    info!("syndicast-daemon starting");

    let engine = DispatchEngine::from_config(&config).await?;
    engine.set_maintenance_mode(cli.maintenance);
    let report = engine.start().await?;
    info!(
        rearmed = report.rearmed,
        interrupted = report.interrupted,
        "Recovered pending work"
    );

    let result = serve(&engine, &cli).await;

    engine.stop().await;
    info!("syndicast-daemon stopped");
    result
}

/// Run until a shutdown signal, or until stdin closes with `--once`
async fn serve(engine: &DispatchEngine, cli: &Cli) -> anyhow::Result<()> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    if cli.once && !cli.stdin {
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reading = cli.stdin;

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("Received shutdown signal, stopping gracefully...");
                return Ok(());
            }
            line = lines.next_line(), if reading => {
                match line.context("failed to read stdin")? {
                    Some(line) => handle_line(engine, &line).await?,
                    None => {
                        info!("stdin closed");
                        reading = false;
                        if cli.once {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

async fn handle_line(engine: &DispatchEngine, line: &str) -> anyhow::Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let outcome = match serde_json::from_str::<SubmitRequest>(line) {
        Ok(request) => match engine.submit(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Submit failed: {}", e);
                SubmitOutcome::Rejected {
                    task_id: None,
                    reason: e.to_string(),
                }
            }
        },
        Err(e) => {
            warn!("Ignoring malformed request: {}", e);
            SubmitOutcome::Rejected {
                task_id: None,
                reason: format!("invalid request: {}", e),
            }
        }
    };

    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("signal setup failed")?;
    let handle = signals.handle();
    signals.next().await;
    handle.close();
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("signal setup failed")
}
