//! DevMaster CLI entry point
//!
//! Speaks JSON lines: commands on stdin, events on stdout, logs on stderr.

use anyhow::Result;
use clap::Parser;
use devmaster::{write_events, Command, Config, Event, Orchestrator};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(name = "devmaster", version, about = "Supervise script-based dev projects")]
struct Cli {
    /// Config file (defaults to ~/.devmaster/config.yml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Scan this directory right after startup
    #[arg(short, long)]
    scan: Option<PathBuf>,

    /// Override the resource sampling interval
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    log::info!("🚀 DevMaster v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(interval) = cli.interval_ms {
        config.monitor_interval_ms = interval;
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
    let writer = tokio::spawn(async move {
        if let Err(e) = write_events(event_rx, tokio::io::stdout()).await {
            log::error!("Writing events failed: {}", e);
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
    if let Some(dir) = cli.scan {
        cmd_tx.send(Command::ScanDir(dir)).await?;
    }
    spawn_stdin_reader(cmd_tx);

    let orchestrator = Orchestrator::new(config, Arc::new(event_tx));
    orchestrator.run(cmd_rx, shutdown_signal()).await?;

    // Output forwarders of killed tasks may still hold sinks; don't wait on them forever.
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        log::warn!("Event writer did not drain in time");
    }

    log::info!("👋 Bye");
    Ok(())
}

/// Read commands from stdin on a plain thread so a pending read never holds
/// up runtime shutdown.
fn spawn_stdin_reader(tx: mpsc::Sender<Command>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Reading control channel failed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Command::from_json_line(&line) {
                Ok(command) => {
                    if tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Ignoring malformed command {:?}: {}", line, e),
            }
        }
        log::debug!("Control channel input ended");
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
