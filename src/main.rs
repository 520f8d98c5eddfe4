#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # seedsync
//!
//! Keeps a local directory in sync with a directory on a remote seedbox.
//!
//! The daemon scans both trees, downloads what the user (or an auto-queue
//! pattern) asks for with lftp, and extracts finished archives.
//!
//! ## Subcommands
//!
//! - `seedsync run` (default): run the daemon
//! - `seedsync scan <PATH>`: print a JSON snapshot of `PATH` (what the remote
//!   scanner runs on the seedbox over ssh)
//! - `seedsync worker <KIND>`: run one supervised worker (spawned by the daemon)
//!
//! ## Architecture
//!
//! ```text
//! main.rs            entry point, clap subcommands, startup, graceful shutdown
//! config.rs          TOML + env-var configuration
//! supervisor/
//!   mod.rs           WorkerProcess: spawn, frames, propagate_exception, terminate
//!   worker.rs        Worker trait and the child-side loop
//! scan/
//!   local.rs         recursive local scan
//!   remote.rs        `seedsync scan` over ssh
//!   worker.rs        periodic scanner worker
//! extract/
//!   mod.rs           archive detection and extraction
//!   worker.rs        extraction worker
//! lftp/
//!   job_status.rs    LftpJobStatus and transfer progress
//!   parser.rs        `jobs -v` parser
//!   mod.rs           TransferClient and the lftp process
//! model/
//!   file.rs          ModelFile tree
//!   diff.rs          model diffs
//!   mod.rs           Model and listeners
//! controller/
//!   mod.rs           tick loop and commands
//!   builder.rs       builds the next model from scans and job status
//!   persist.rs       downloaded/extracted record
//!   autoqueue.rs     auto-queue patterns
//! shell/
//!   process.rs       one-shot program execution with timeout
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use seedsync::config::Config;
use seedsync::controller::{
    Controller, ControllerParts, ControllerPersist, ControllerSettings, PatternStore,
};
use seedsync::extract::worker::ExtractWorker;
use seedsync::extract::{ExtractEvent, ExtractRequest};
use seedsync::lftp::{Lftp, LftpSettings};
use seedsync::model::ModelEvent;
use seedsync::scan::local::scan_local;
use seedsync::scan::remote::RemoteScanner;
use seedsync::scan::ScanResult;
use seedsync::scan::worker::{ScanTarget, ScannerWorker};
use seedsync::supervisor::worker::run_worker;
use seedsync::supervisor::{WorkerError, WorkerProcess};

/// Seedbox-to-local synchronization daemon.
#[derive(Parser)]
#[command(name = "seedsync", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Print a JSON snapshot of a directory tree.
    Scan {
        /// Directory to scan.
        path: PathBuf,
    },
    /// Run one supervised worker, talking JSON lines on stdin/stdout.
    #[command(hide = true)]
    Worker {
        kind: WorkerKind,
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum WorkerKind {
    LocalScan,
    RemoteScan,
    Extract,
}

impl WorkerKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::LocalScan => "local-scan",
            Self::RemoteScan => "remote-scan",
            Self::Extract => "extract",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        None => run_daemon(None).await,
        Some(Commands::Run { config }) => run_daemon(config.as_deref()).await,
        Some(Commands::Scan { path }) => run_scan(&path),
        Some(Commands::Worker { kind, config }) => run_worker_mode(kind, config.as_deref()).await,
    }
}

/// Logs go to stderr; stdout carries scan output and worker frames.
fn init_tracing(level: &str) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_scan(path: &Path) -> ExitCode {
    let files = match scan_local(path) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("seedsync: {e}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string(&files) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("seedsync: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_worker_mode(kind: WorkerKind, config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("seedsync: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level);

    let stdin = tokio::io::stdin();
    let stdout = Box::new(std::io::stdout());
    let result = match kind {
        WorkerKind::LocalScan => {
            let worker = ScannerWorker::new(
                kind.as_str(),
                ScanTarget::Local(PathBuf::from(&config.local.path)),
                Duration::from_millis(config.controller.interval_ms_local_scan),
            );
            run_worker(worker, stdin, stdout).await
        }
        WorkerKind::RemoteScan => {
            let worker = ScannerWorker::new(
                kind.as_str(),
                ScanTarget::Remote(RemoteScanner::from_config(&config)),
                Duration::from_millis(config.controller.interval_ms_remote_scan),
            );
            run_worker(worker, stdin, stdout).await
        }
        WorkerKind::Extract => run_worker(ExtractWorker, stdin, stdout).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(worker = kind.as_str(), "Worker failed: {e}");
            // The pending stdin read cannot be cancelled and would hold up
            // runtime shutdown until the supervisor closes the pipe.
            std::process::exit(1);
        }
    }
}

async fn run_daemon(config_path: Option<&str>) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("seedsync: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&config.logging.level);

    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    info!("seedsync v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        remote = %format!("{}@{}:{}", config.remote.username, config.remote.address, config.remote.path),
        local = %config.local.path,
        "Syncing"
    );

    match serve(&config, config_path).await {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: &Config, config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = PathBuf::from(&config.general.data_dir);
    let persist_path = data_dir.join("controller.json");
    let persist = ControllerPersist::load(&persist_path)?;
    let patterns = PatternStore::open(data_dir.join("autoqueue.json"))?;
    info!(
        data_dir = %data_dir.display(),
        downloaded = persist.downloaded.len(),
        "Loaded controller state"
    );

    let grace = Duration::from_millis(config.general.terminate_timeout_ms);
    let remote_scan: WorkerProcess<(), ScanResult> =
        spawn_worker(WorkerKind::RemoteScan, config_path, grace)?;
    let local_scan: WorkerProcess<(), ScanResult> =
        spawn_worker(WorkerKind::LocalScan, config_path, grace)?;
    let extractor: WorkerProcess<ExtractRequest, ExtractEvent> =
        spawn_worker(WorkerKind::Extract, config_path, grace)?;
    let transfer = Lftp::spawn(LftpSettings::from_config(config)).await?;

    let settings = ControllerSettings {
        local_path: PathBuf::from(&config.local.path),
        extract_dir: PathBuf::from(config.extract_dir()),
        tick: Duration::from_millis(config.controller.tick_ms),
        downloading_scan_interval: Duration::from_millis(
            config.controller.interval_ms_downloading_scan,
        ),
        autoqueue_enabled: config.autoqueue.enabled,
        patterns_only: config.autoqueue.patterns_only,
        auto_extract: config.autoqueue.auto_extract,
        persist_path: Some(persist_path),
    };
    let parts = ControllerParts {
        remote_scan: Box::new(remote_scan),
        local_scan: Box::new(local_scan),
        extractor: Box::new(extractor),
        transfer: Box::new(transfer),
    };
    let (controller, handle) = Controller::new(settings, parts, persist, patterns);
    let event_log = tokio::spawn(log_model_events(handle.subscribe()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let result = controller.run(shutdown_rx).await;
    event_log.abort();
    result?;
    Ok(())
}

/// Start `seedsync worker <kind>` from the current executable.
fn spawn_worker<Req, Out>(
    kind: WorkerKind,
    config_path: Option<&str>,
    grace: Duration,
) -> Result<WorkerProcess<Req, Out>, WorkerError>
where
    Req: Serialize,
    Out: DeserializeOwned + Send + 'static,
{
    let exe = std::env::current_exe().map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
    let mut args = vec!["worker".to_string(), kind.as_str().to_string()];
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.to_string());
    }
    WorkerProcess::spawn(kind.as_str(), exe, &args, grace)
}

async fn log_model_events(mut events: broadcast::Receiver<ModelEvent>) {
    loop {
        match events.recv().await {
            Ok(ModelEvent::FileAdded { file }) => {
                debug!(name = %file.name(), state = file.state().as_str(), "File added");
            }
            Ok(ModelEvent::FileRemoved { file }) => {
                debug!(name = %file.name(), "File removed");
            }
            Ok(ModelEvent::FileUpdated { old_file, new_file }) => {
                if old_file.state() != new_file.state() {
                    info!(
                        name = %new_file.name(),
                        from = old_file.state().as_str(),
                        to = new_file.state().as_str(),
                        "State changed"
                    );
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Model event log lagged, skipped {n} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
