//! Worker lifecycle: startup, the main loops and mode selection.
//!
//! [`start`] is the single entrypoint. Depending on the environment and the
//! runtime arguments it either serves jobs from the control plane, runs one
//! local test job, or exposes the local development API.
//!
//! # Serving flow
//!
//! 1. Run registered fitness checks; any failure exits non-zero
//! 2. Load the in-progress registry from disk
//! 3. Start the heartbeat on its own thread
//! 4. Install SIGTERM/SIGINT handlers feeding the shutdown token
//! 5. Run the fetch and run loops until the drain completes

pub mod fitness;
pub mod handler;
pub mod heartbeat;
pub mod local;
pub mod scaler;

use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{self, Endpoints, RpArgs, WorkerConfig};
use crate::error::Result;
use crate::registry::JobRegistry;
use crate::transport::{progress, Transport};

pub use handler::Handler;
pub use scaler::{JobScaler, WorkerState};
use heartbeat::Heartbeat;

/// Start the worker, parsing runtime arguments from the command line. Does
/// not return until the worker stops; exits the process on fatal errors.
pub fn start(config: WorkerConfig) {
    let args = RpArgs::parse();
    start_with_args(config, args)
}

/// Like [`start`], with the runtime arguments supplied by the caller.
pub fn start_with_args(mut config: WorkerConfig, args: RpArgs) {
    config.rp_args = args;
    init_logging(&config.rp_args);

    tracing::info!(version = crate::VERSION, "Starting serverless worker");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(error = %err, "Failed to build runtime");
            std::process::exit(1);
        }
    };

    if config.rp_args.rp_serve_api {
        let host = config.rp_args.rp_api_host.clone();
        let port = config.rp_args.rp_api_port;
        if let Err(err) = runtime.block_on(crate::api::serve(config, &host, port)) {
            tracing::error!(error = %err, "API server failed");
            std::process::exit(1);
        }
        return;
    }

    if let Some(port) = config::realtime_port() {
        tracing::info!(
            port,
            concurrency = config::realtime_concurrency(),
            "Starting API server for realtime serving"
        );
        if let Err(err) = runtime.block_on(crate::api::serve(config, "0.0.0.0", port)) {
            tracing::error!(error = %err, "API server failed");
            std::process::exit(1);
        }
        return;
    }

    let endpoints = Endpoints::from_env();
    if config.rp_args.test_input.is_some() || !endpoints.serving_mode() {
        let code = runtime.block_on(local::run_local(&config));
        std::process::exit(code);
    }

    if let Err(err) = runtime.block_on(run_worker(config, endpoints)) {
        tracing::error!(error = %err, "Worker failed");
        std::process::exit(1);
    }
}

fn init_logging(args: &RpArgs) {
    let directive = config::log_directive(args);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
        )
        .try_init();
}

/// Watch for termination signals. The first SIGTERM or SIGINT cancels the
/// shutdown token, which stops acquisition and drains queued and in-flight
/// jobs; a second signal exits immediately for operators who do not want
/// to wait on a slow handler. In-flight jobs abandoned by the hard exit
/// stay in the registry, so the control plane re-dispatches them.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    tracing::error!("Failed to install signal handlers, relying on refresh_worker");
                    return;
                }
            };

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = name, "Termination requested, draining in-flight jobs");
        shutdown.cancel();

        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        tracing::warn!("Second termination signal, exiting without draining");
        std::process::exit(130);
    });
}

/// Run the worker against the control plane until shutdown completes.
pub async fn run_worker(config: WorkerConfig, endpoints: Endpoints) -> Result<()> {
    fitness::run_fitness_checks(&config.fitness_checks).await?;

    let registry = Arc::new(JobRegistry::load(&config.registry_path)?);

    let heartbeat = Heartbeat::new(&endpoints, config.registry_path.clone()).start();

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let transport = Arc::new(Transport::new(endpoints)?);
    progress::spawn_progress_forwarder(transport.clone());

    let scaler = Arc::new(JobScaler::new(config, transport, registry, shutdown));
    scaler.run().await;

    heartbeat.stop();
    tracing::info!("Worker stopped");
    Ok(())
}
