//! Local test mode: run the handler once against a synthesized job.
//!
//! Entered when `--test_input` is passed or no acquisition endpoint is
//! configured. Nothing is posted to the control plane; results are logged
//! and the process exit code reflects the outcome.

use serde_json::Value;

use crate::config::{Endpoints, WorkerConfig};
use crate::job::Job;
use crate::transport::Transport;
use crate::worker::handler::{run_job, run_stream_job};

const TEST_INPUT_FILE: &str = "test_input.json";

fn local_endpoints() -> Endpoints {
    let mut endpoints = Endpoints::from_env();
    endpoints.job_take_url = None;
    endpoints.job_done_url = None;
    endpoints.job_stream_url = None;
    endpoints.ping_url = None;
    endpoints
}

/// Run the local test job and return the process exit code.
pub async fn run_local(config: &WorkerConfig) -> i32 {
    let raw = match &config.rp_args.test_input {
        Some(raw) => {
            tracing::info!("test_input set, using it as the job");
            raw.clone()
        }
        None => match std::fs::read_to_string(TEST_INPUT_FILE) {
            Ok(contents) => {
                tracing::info!("Using {TEST_INPUT_FILE} as the job");
                contents
            }
            Err(_) => {
                tracing::warn!("{TEST_INPUT_FILE} not found, exiting");
                return 1;
            }
        },
    };

    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(error = %err, "Test input is not valid JSON");
            return 1;
        }
    };

    let Some(input) = parsed.get("input") else {
        tracing::error!("Job has no input parameter, unable to run");
        return 1;
    };

    let id = parsed
        .get("id")
        .and_then(|value| value.as_str())
        .unwrap_or("local_test")
        .to_string();
    let job = Job::new(id.clone(), input.clone());
    tracing::debug!(job_id = %job.id, "Retrieved local test job");

    let endpoints = local_endpoints();
    let transport = match Transport::new(endpoints.clone()) {
        Ok(transport) => transport,
        Err(err) => {
            tracing::error!(error = %err, "Failed to build HTTP client");
            return 1;
        }
    };

    let result = if config.handler.is_stream() {
        run_stream_job(
            &config.handler,
            &job,
            &endpoints,
            &transport,
            config.return_aggregate_stream,
            config.max_output_bytes,
        )
        .await
    } else {
        run_job(&config.handler, &job, &endpoints, config.max_output_bytes).await
    };

    let wire = result.to_wire();
    if result.is_error() {
        tracing::error!(job_id = %id, result = %wire, "Local test job failed");
        1
    } else {
        tracing::info!(job_id = %id, result = %wire, "Local test complete");
        0
    }
}
