mod cli;
mod config;
mod logging;
mod runner;
mod server;

use crate::cli::Args;
use crate::config::{load_file_config, FileConfig, RunnerConfig};
use crate::logging::init_tracing;
use crate::runner::{CommandRunner, Supervisor};
use crate::server::{router, AppState};
use anyhow::Context;
use clap::Parser;
use hook_signature::Authenticator;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let file_config = match args.config.as_deref() {
        Some(path) => load_file_config(path)?,
        None => FileConfig::default(),
    };
    let log_dir = config::log_dir(&args, &file_config);
    let _file_guard = init_tracing(log_dir.as_deref(), args.log_to_stderr)?;

    let config = RunnerConfig::resolve(args, file_config)?;
    info!(
        address = %config.address,
        command = %config.command,
        working_dir = ?config.command.working_dir,
        timeout_secs = config.command.timeout.as_secs(),
        auth = config.auth_mode(),
        "hook-runner starting"
    );

    let authenticator = Arc::new(Authenticator::new(config.secret, config.no_secret));
    let fatal = CancellationToken::new();
    let runner: Arc<dyn CommandRunner> = Arc::new(Supervisor::new(
        config.command,
        config.capture_dir,
        fatal.clone(),
    ));
    let app = router(AppState::new(authenticator, runner));

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("failed to bind {}", config.address))?;
    info!(addr = %config.address, "hook-runner listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .into_future();
    tokio::select! {
        result = serve => result?,
        // Returning drops the file log guard, so the kill failure is flushed.
        _ = fatal.cancelled() => anyhow::bail!("a timed-out command could not be killed"),
    }
    info!("hook-runner shutting down");
    Ok(())
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
