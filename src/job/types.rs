use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, WorkerError};

/// A unit of work acquired from the control plane.
///
/// Immutable once constructed; two jobs are equal iff their identifiers
/// match.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub webhook: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
            webhook: None,
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Job {}

impl std::hash::Hash for Job {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Parse the body of an acquisition response: either a single job object or
/// an array of them.
pub fn parse_job_take(body: &str) -> Result<Vec<Job>> {
    let value: Value = serde_json::from_str(body)?;

    let raw_jobs = match value {
        Value::Object(_) => vec![value],
        Value::Array(items) => items,
        other => {
            return Err(WorkerError::MalformedJob(format!(
                "expected object or array, got {other}"
            )))
        }
    };

    let mut jobs = Vec::with_capacity(raw_jobs.len());
    for raw in raw_jobs {
        if raw.get("input").is_none() {
            return Err(WorkerError::MalformedJob(
                "job has missing field(s): id or input".to_string(),
            ));
        }
        let job: Job = serde_json::from_value(raw)?;
        if job.id.is_empty() {
            return Err(WorkerError::MalformedJob(
                "job has missing field(s): id or input".to_string(),
            ));
        }
        jobs.push(job);
    }
    Ok(jobs)
}

/// Identity envelope attached to handler crashes so the control plane can
/// attribute the failure to a worker build.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub error_type: String,
    pub error_message: String,
    /// The panic-site backtrace when the handler panicked; the error
    /// source chain when it returned an error (a returned error carries no
    /// backtrace to recover after the fact).
    pub error_traceback: String,
    pub hostname: String,
    pub worker_id: String,
    pub runpod_version: String,
}

/// Terminal outcome of a job. Posted exactly once per job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success { output: Value },
    UserError { message: Value },
    RuntimeError(ErrorEnvelope),
}

/// A terminal outcome plus the refresh flag carried alongside it.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub outcome: JobOutcome,
    pub refresh_worker: bool,
}

impl JobResult {
    pub fn success(output: Value) -> Self {
        Self {
            outcome: JobOutcome::Success { output },
            refresh_worker: false,
        }
    }

    pub fn user_error(message: Value) -> Self {
        Self {
            outcome: JobOutcome::UserError { message },
            refresh_worker: false,
        }
    }

    pub fn runtime_error(envelope: ErrorEnvelope) -> Self {
        Self {
            outcome: JobOutcome::RuntimeError(envelope),
            refresh_worker: false,
        }
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh_worker = self.refresh_worker || refresh;
        self
    }

    pub fn is_error(&self) -> bool {
        !matches!(self.outcome, JobOutcome::Success { .. })
    }

    /// Wire encoding posted to the result endpoint. Empty success outputs
    /// are omitted; runtime errors are flattened to a JSON document inside
    /// the `error` field.
    pub fn to_wire(&self) -> Value {
        let mut body = Map::new();
        match &self.outcome {
            JobOutcome::Success { output } => {
                if !output.is_null() {
                    body.insert("output".to_string(), output.clone());
                }
            }
            JobOutcome::UserError { message } => {
                body.insert("error".to_string(), message.clone());
            }
            JobOutcome::RuntimeError(envelope) => {
                body.insert(
                    "error".to_string(),
                    Value::String(json!(envelope).to_string()),
                );
            }
        }
        if self.refresh_worker {
            body.insert("stopPod".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }
}

/// A non-terminal partial emitted by a streaming handler.
#[derive(Debug, Clone)]
pub struct StreamFragment {
    pub output: Value,
}

impl StreamFragment {
    pub fn to_wire(&self) -> Value {
        json!({ "output": self.output })
    }
}

/// Best-effort side-channel message from inside a handler, out of band from
/// the result path.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub payload: Value,
}

impl ProgressUpdate {
    pub fn to_wire(&self) -> Value {
        json!({ "status": "IN_PROGRESS", "output": self.payload })
    }
}
