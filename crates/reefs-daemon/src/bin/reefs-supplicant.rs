// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! REEFS supplicant executable
//!
//! Runs in the foreground; a service manager is expected to supervise it.

use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use reefs_daemon::adapter::PARENT_DIR_MODE;
use reefs_daemon::{
    ConfigOverrides, ConfinedRoot, Dispatcher, FsAdapter, InstanceLock, Supervisor,
    SupervisorStats, SupplicantConfig, TeeTransport, TransportError,
};
use reefs_logging::{CliLogLevel, CliLoggingArgs};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{error, info};

const COMPONENT: &str = "reefs-supplicant";

#[derive(Parser, Debug)]
#[command(name = "reefs-supplicant")]
#[command(about = "Serves REEFS filesystem requests from the secure OS")]
#[command(version, author, long_about = None)]
struct Cli {
    /// Confinement root for all filesystem requests
    #[arg(long, env = "REEFS_ROOT")]
    root: Option<PathBuf>,

    /// TEE character device
    #[arg(long, env = "REEFS_TEE_DEVICE")]
    device: Option<PathBuf>,

    /// TOML configuration file
    #[arg(long, env = "REEFS_CONFIG")]
    config: Option<PathBuf>,

    /// Size of the shared arena in bytes
    #[arg(long)]
    arena_size: Option<usize>,

    /// TEE implementation id the driver must report
    #[arg(long)]
    expected_impl_id: Option<u32>,

    /// Lock file guarding against a second instance
    #[arg(long)]
    lock_file: Option<PathBuf>,

    /// Keep the default scheduling policy for the serving thread
    #[arg(long)]
    no_realtime: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Cli {
    fn resolve_config(&self) -> Result<SupplicantConfig> {
        let base = match &self.config {
            Some(path) => SupplicantConfig::load(path)?,
            None => SupplicantConfig::default(),
        };
        let config = ConfigOverrides {
            root: self.root.clone(),
            device: self.device.clone(),
            arena_size: self.arena_size,
            expected_impl_id: self.expected_impl_id,
            lock_file: self.lock_file.clone(),
            no_realtime: self.no_realtime,
        }
        .apply(base);
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.logging.clone().init_with_default_level(COMPONENT, CliLogLevel::Info) {
        let _ = writeln!(std::io::stderr(), "Failed to initialize logging: {}", e);
    }

    let span = tracing::info_span!("daemon", component = COMPONENT);
    let _enter = span.enter();

    let config = cli.resolve_config()?;
    let _lock = InstanceLock::acquire(&config.lock_file)?;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(PARENT_DIR_MODE)
        .create(&config.root)
        .with_context(|| format!("creating confinement root {:?}", config.root))?;

    info!(
        root = %config.root.display(),
        device = %config.device.display(),
        arena_size = config.arena_size,
        "Starting REEFS supplicant"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = oneshot::channel();
    let serve_config = config.clone();
    let serve_shutdown = shutdown.clone();
    let serve_span = span.clone();
    thread::Builder::new()
        .name("reefs-serve".to_string())
        .spawn(move || {
            let _enter = serve_span.enter();
            let _ = done_tx.send(serve(serve_config, serve_shutdown));
        })
        .context("spawning serve thread")?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = done_rx => {
            match result.context("serve thread exited without a result")? {
                Ok(stats) => info!(
                    restart_count = stats.restart_count,
                    requests_served = stats.requests_served,
                    "Supplicant stopped"
                ),
                Err(err) => {
                    error!(error = %err, "Supplicant could not establish a session");
                    return Err(err.into());
                }
            }
        }
        _ = sigint.recv() => {
            info!(operation = "shutdown", signal = "SIGINT", "Received SIGINT, shutting down");
            shutdown.store(true, Ordering::SeqCst);
        }
        _ = sigterm.recv() => {
            info!(operation = "shutdown", signal = "SIGTERM", "Received SIGTERM, shutting down");
            shutdown.store(true, Ordering::SeqCst);
        }
    }

    // The serve thread may be blocked in the driver; process exit releases it.
    Ok(())
}

fn serve(
    config: SupplicantConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<SupervisorStats, TransportError> {
    let adapter = FsAdapter::with_capacity(
        ConfinedRoot::new(&config.root),
        config.max_open_files,
        config.max_open_dirs,
    );
    let mut supervisor = Supervisor::new(
        TeeTransport::new(&config.device),
        Dispatcher::new(adapter),
        config.supervisor_options(),
    )
    .with_shutdown(shutdown);
    supervisor.run()
}
