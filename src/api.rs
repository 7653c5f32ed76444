//! Local development API server.
//!
//! Exposes the handler over plain HTTP so workers can be exercised without
//! the control plane: `POST /runsync` invokes the handler on a synthesized
//! job and returns the terminal result. Streaming handlers are aggregated,
//! since the synchronous endpoint must return everything at once.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::{Endpoints, WorkerConfig};
use crate::error::Result;
use crate::job::Job;
use crate::transport::Transport;
use crate::worker::handler::{run_job, run_stream_job, Handler};

struct ApiState {
    handler: Handler,
    endpoints: Endpoints,
    transport: Transport,
    max_output_bytes: usize,
}

pub async fn serve(config: WorkerConfig, host: &str, port: u16) -> Result<()> {
    let mut endpoints = Endpoints::from_env();
    endpoints.job_take_url = None;
    endpoints.job_done_url = None;
    endpoints.job_stream_url = None;
    endpoints.ping_url = None;

    let transport = Transport::new(endpoints.clone())?;
    let state = Arc::new(ApiState {
        handler: config.handler,
        endpoints,
        transport,
        max_output_bytes: config.max_output_bytes,
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/runsync", post(runsync_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!(host, port, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn runsync_handler(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(input) = body.get("input") else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "request has no input parameter" })),
        );
    };

    let job = Job::new(format!("test-{}", Uuid::new_v4()), input.clone());
    tracing::debug!(job_id = %job.id, "Running API job");

    let result = if state.handler.is_stream() {
        run_stream_job(
            &state.handler,
            &job,
            &state.endpoints,
            &state.transport,
            true,
            state.max_output_bytes,
        )
        .await
    } else {
        run_job(&state.handler, &job, &state.endpoints, state.max_output_bytes).await
    };

    let mut wire = result.to_wire();
    if let Some(map) = wire.as_object_mut() {
        map.insert("id".to_string(), Value::String(job.id.clone()));
    }

    (StatusCode::OK, Json(wire))
}
