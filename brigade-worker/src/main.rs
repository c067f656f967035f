//! Brigade Worker binary
//!
//! Runs the job named by `BRIGADE_JOB_ID` and exits:
//! - Configuration: load settings from environment or defaults
//! - Repositories: HTTP communication with the controller
//! - Supervisor: job lifecycle, from taking the job to its result
//!
//! SIGTERM or SIGINT cancels the running job; its result is still submitted.

use anyhow::{Context, Result};
use brigade_client::ControllerClient;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use brigade_worker::builtin::BuiltinRegistry;
use brigade_worker::config::Config;
use brigade_worker::repository::Repositories;
use brigade_worker::scheduler::JobSupervisor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brigade_worker=info,brigade_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Brigade Worker");

    let config = load_config()?;
    let job_id = config
        .job_id
        .context("BRIGADE_JOB_ID environment variable not set")?;
    info!(
        "Loaded configuration: worker_name={}, api_url={}, basedir={}",
        config.worker_name,
        config.api_url,
        config.basedir.display()
    );

    let mut client = ControllerClient::new(config.api_url.clone());
    if let Some(token) = &config.api_token {
        client = client.with_token(token.clone());
    }
    let repos = Repositories::http(Arc::new(client));

    let shutdown = install_shutdown_handler().context("Failed to install signal handlers")?;

    let supervisor = JobSupervisor::new(config, repos, Arc::new(BuiltinRegistry::with_defaults()));
    match supervisor.process_job(job_id, &shutdown).await {
        Ok(result) => {
            info!(
                "Job {} done: {} ({}s)",
                result.job_id, result.status, result.duration_seconds
            );
            Ok(())
        }
        Err(e) => {
            error!("Job {} not run: {:#}", job_id, e);
            Err(e)
        }
    }
}

/// Loads configuration from environment variables with fallback to defaults
fn load_config() -> Result<Config> {
    match Config::from_env() {
        Ok(config) => {
            config.validate()?;
            Ok(config)
        }
        Err(e) => {
            info!("Failed to load config from environment ({}), using defaults", e);
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Cancels the returned token on SIGTERM or SIGINT
fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => warn!("Received SIGTERM, cancelling job"),
            _ = sigint.recv() => warn!("Received SIGINT, cancelling job"),
        }
        cancel.cancel();
    });

    Ok(token)
}
