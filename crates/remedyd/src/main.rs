//! remedyd - issue detection and remediation daemon
//!
//! Polls containers, services and the host, tracks issues and serves the
//! remediation API on localhost.

use anyhow::{Context, Result};
use clap::Parser;
use remedy_common::Config;
use remedyd::collectors::CompositeSource;
use remedyd::diagnosis::PlaybookDiagnosis;
use remedyd::runner::SystemRunner;
use remedyd::server::{self, AppState};
use remedyd::{store, Collaborators, Engine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Issue detection and remediation daemon
#[derive(Parser)]
#[command(name = "remedyd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to /etc/remedy/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file
    #[arg(long)]
    listen: Option<String>,
}

/// How often idle wizard sessions are swept
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("remedyd v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    let store = store::open(&config.storage).context("Failed to open history store")?;

    let source = CompositeSource::from_config(&config.sources);
    if source.is_empty() {
        warn!("No metrics sources enabled, nothing will be detected");
    }
    let collaborators = Collaborators {
        source: Arc::new(source),
        diagnosis: Arc::new(PlaybookDiagnosis::new()),
        runner: Arc::new(SystemRunner::new(config.sources.docker_bin.clone())),
    };

    let engine = Arc::new(Engine::new(&config, store, collaborators).context("Invalid rules")?);
    let restored = engine.restore().context("Failed to restore issues")?;
    info!(
        restored,
        rules = engine.monitor().rules().len(),
        "Engine ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = tokio::spawn(Arc::clone(&engine).run_monitor(shutdown_rx.clone()));
    let reaper = tokio::spawn(Arc::clone(&engine).run_reaper(REAPER_INTERVAL, shutdown_rx.clone()));

    let request_timeout = config.monitor.poll_timeout() + config.wizard.diagnosis_timeout();
    let app = server::router(AppState::new(Arc::clone(&engine)), request_timeout);
    let listen = config.server.listen.clone();
    let mut http = tokio::spawn(async move { server::run(app, &listen, shutdown_rx).await });

    let exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            info!("Shutting down gracefully");
            None
        }
        // Server exited on its own, most likely a bind failure
        exited = &mut http => Some(exited),
    };
    let _ = shutdown_tx.send(true);
    let outcome = match exited {
        Some(outcome) => outcome,
        None => http.await,
    };

    for (name, task) in [("monitor", monitor), ("reaper", reaper)] {
        if let Err(e) = task.await {
            error!("{} task panicked: {}", name, e);
        }
    }
    outcome.context("HTTP task panicked")?
}
