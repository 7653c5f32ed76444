//! Test harness: an in-process mock control plane.
//!
//! Runs a real HTTP server on a loopback port with the four endpoints the
//! worker talks to, records every request, and lets tests script the
//! acquisition responses (jobs, rate limits, fast-boot 400s).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use runpod_worker::config::Endpoints;

/// Scripted override for the next acquisition response.
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum TakeBehavior {
    RateLimited,
    FastBoot,
    NoContent,
    ServerError,
}

#[derive(Debug, Clone)]
pub struct RecordedTake {
    pub batch_size: Option<usize>,
    pub job_in_progress: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub id: String,
    pub is_stream: String,
    pub content_type: String,
    pub body: Value,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct RecordedPing {
    pub job_id: String,
    pub retry_ping: Option<String>,
    pub at: Instant,
}

#[derive(Default)]
pub struct ControlPlaneState {
    pending_jobs: Mutex<VecDeque<Value>>,
    behaviors: Mutex<VecDeque<TakeBehavior>>,
    pub takes: Mutex<Vec<RecordedTake>>,
    pub results: Mutex<Vec<RecordedPost>>,
    pub streams: Mutex<Vec<RecordedPost>>,
    pub pings: Mutex<Vec<RecordedPing>>,
    pub fail_results: AtomicBool,
    pub fail_pings: AtomicBool,
    /// Result POST attempts, including the ones failed on purpose.
    pub result_attempts: AtomicUsize,
    /// Ping attempts, including the ones failed on purpose.
    pub ping_attempts: AtomicUsize,
}

pub struct MockControlPlane {
    pub state: Arc<ControlPlaneState>,
    pub addr: SocketAddr,
}

#[allow(dead_code)]
impl MockControlPlane {
    pub async fn start() -> Self {
        let state = Arc::new(ControlPlaneState::default());

        let app = Router::new()
            .route("/job-take/worker", get(take_handler))
            .route("/job-take-batch/worker", get(take_handler))
            .route("/job-done", post(done_handler))
            .route("/job-stream", post(stream_handler))
            .route("/ping", get(ping_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock control plane");
        let addr = listener.local_addr().expect("mock control plane addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { state, addr }
    }

    /// Endpoints pointing the worker at this mock.
    pub fn endpoints(&self, ping_interval: Duration) -> Endpoints {
        Endpoints {
            job_take_url: Some(format!("http://{}/job-take/worker", self.addr)),
            job_done_url: Some(format!("http://{}/job-done", self.addr)),
            job_stream_url: Some(format!("http://{}/job-stream", self.addr)),
            ping_url: Some(format!("http://{}/ping", self.addr)),
            ping_interval,
            worker_id: "test-worker".to_string(),
            hostname: "test-host".to_string(),
        }
    }

    /// Queue a job for a later acquisition call.
    pub fn push_job(&self, id: &str, input: Value) {
        self.state
            .pending_jobs
            .lock()
            .unwrap()
            .push_back(json!({ "id": id, "input": input }));
    }

    /// Script an override for the next acquisition call.
    pub fn push_behavior(&self, behavior: TakeBehavior) {
        self.state.behaviors.lock().unwrap().push_back(behavior);
    }

    pub fn results(&self) -> Vec<RecordedPost> {
        self.state.results.lock().unwrap().clone()
    }

    pub fn streams(&self) -> Vec<RecordedPost> {
        self.state.streams.lock().unwrap().clone()
    }

    pub fn pings(&self) -> Vec<RecordedPing> {
        self.state.pings.lock().unwrap().clone()
    }

    pub fn takes(&self) -> Vec<RecordedTake> {
        self.state.takes.lock().unwrap().clone()
    }
}

/// Poll until `condition` holds or the timeout elapses. Returns whether the
/// condition was observed.
#[allow(dead_code)]
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

async fn take_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let batch_size = params
        .get("batch_size")
        .and_then(|raw| raw.parse::<usize>().ok());
    state.takes.lock().unwrap().push(RecordedTake {
        batch_size,
        job_in_progress: params.get("job_in_progress").cloned().unwrap_or_default(),
        at: Instant::now(),
    });

    if let Some(behavior) = state.behaviors.lock().unwrap().pop_front() {
        return match behavior {
            TakeBehavior::RateLimited => (StatusCode::TOO_MANY_REQUESTS, String::new()),
            TakeBehavior::FastBoot => (StatusCode::BAD_REQUEST, String::new()),
            TakeBehavior::NoContent => (StatusCode::NO_CONTENT, String::new()),
            TakeBehavior::ServerError => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
        };
    }

    let jobs: Vec<Value> = {
        let mut pending = state.pending_jobs.lock().unwrap();
        let count = batch_size.unwrap_or(1).min(pending.len());
        pending.drain(..count).collect()
    };

    if jobs.is_empty() {
        // Emulate the control plane's long poll so an idle worker does not
        // hammer the endpoint during tests.
        tokio::time::sleep(Duration::from_millis(50)).await;
        return (StatusCode::NO_CONTENT, String::new());
    }

    let body = if batch_size.is_some() {
        Value::Array(jobs).to_string()
    } else {
        jobs[0].to_string()
    };
    (StatusCode::OK, body)
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn done_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    state.result_attempts.fetch_add(1, Ordering::SeqCst);
    if state.fail_results.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    state.results.lock().unwrap().push(RecordedPost {
        id: params.get("id").cloned().unwrap_or_default(),
        is_stream: params.get("isStream").cloned().unwrap_or_default(),
        content_type: content_type(&headers),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
        at: Instant::now(),
    });
    StatusCode::OK
}

async fn stream_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    state.streams.lock().unwrap().push(RecordedPost {
        id: params.get("id").cloned().unwrap_or_default(),
        is_stream: params.get("isStream").cloned().unwrap_or_default(),
        content_type: content_type(&headers),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
        at: Instant::now(),
    });
    StatusCode::OK
}

async fn ping_handler(
    State(state): State<Arc<ControlPlaneState>>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    state.ping_attempts.fetch_add(1, Ordering::SeqCst);
    if state.fail_pings.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    state.pings.lock().unwrap().push(RecordedPing {
        job_id: params.get("job_id").cloned().unwrap_or_default(),
        retry_ping: params.get("retry_ping").cloned(),
        at: Instant::now(),
    });
    StatusCode::OK
}
