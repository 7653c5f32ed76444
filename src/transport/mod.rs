//! HTTP client for the control plane.
//!
//! One pooled client serves every request path: job acquisition, terminal
//! result POSTs, stream fragment POSTs and progress updates. Result and
//! stream bodies are sent form-encoded with a JSON document as the body
//! value; the control plane requires that encoding.

pub mod progress;

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

use crate::config::Endpoints;
use crate::error::{Result, WorkerError};
use crate::job::types::parse_job_take;
use crate::job::{Job, JobResult, ProgressUpdate, StreamFragment};

/// Wall-clock ceiling on one acquisition call.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(90);

/// Result POSTs are retried with Fibonacci delays (1s, 1s, 2s, ...) up to
/// this many attempts, then the failure is logged and swallowed.
pub const RESULT_MAX_ATTEMPTS: u32 = 3;

fn fibonacci_delay(attempt: u32) -> Duration {
    let (mut prev, mut cur) = (1u64, 1u64);
    for _ in 1..attempt {
        let next = prev + cur;
        prev = cur;
        cur = next;
    }
    Duration::from_secs(prev)
}

pub struct Transport {
    client: reqwest::Client,
    endpoints: Endpoints,
}

impl Transport {
    pub fn new(endpoints: Endpoints) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Acquire up to `batch_size` jobs from the job-take endpoint.
    ///
    /// 204 means no jobs are available and 400 means the control plane has
    /// no backlog (fast-boot); both return an empty vec. 429 surfaces as
    /// [`WorkerError::RateLimited`] so the fetch loop can back off.
    pub async fn get_jobs(&self, batch_size: usize, jobs_in_progress: bool) -> Result<Vec<Job>> {
        let base = self
            .endpoints
            .job_take_url
            .as_ref()
            .ok_or(WorkerError::MissingEndpoint("RUNPOD_WEBHOOK_GET_JOB"))?;

        let url = if batch_size > 1 {
            base.replace("/job-take/", "/job-take-batch/")
        } else {
            base.clone()
        };

        let mut request = self
            .client
            .get(&url)
            .timeout(ACQUIRE_TIMEOUT)
            .query(&[("job_in_progress", if jobs_in_progress { "1" } else { "0" })]);
        if batch_size > 1 {
            request = request.query(&[("batch_size", batch_size.to_string())]);
        }

        let response = request.send().await?;
        let status = response.status();
        tracing::debug!(status = status.as_u16(), "Acquisition response");

        match status.as_u16() {
            204 => Ok(Vec::new()),
            400 => {
                tracing::debug!("Acquisition returned 400, no backlog (fast-boot)");
                Ok(Vec::new())
            }
            429 => Err(WorkerError::RateLimited),
            code if !status.is_success() => Err(WorkerError::UnexpectedStatus { status: code, url }),
            _ => {
                let body = response.text().await?;
                if body.is_empty() {
                    return Ok(Vec::new());
                }
                parse_job_take(&body)
            }
        }
    }

    /// Post the terminal result for a job. Retries with Fibonacci delays;
    /// on exhaustion the failure is logged and swallowed so a dead control
    /// plane cannot wedge the worker (its own timeout re-dispatches the
    /// job).
    pub async fn send_result(&self, job: &Job, result: &JobResult, is_stream: bool) {
        let payload = result.to_wire().to_string();

        let url = match &self.endpoints.job_done_url {
            Some(url) => url.clone(),
            None => {
                tracing::warn!(job_id = %job.id, result = %payload, "Local test job results");
                return;
            }
        };

        match self
            .transmit_with_retry(&url, &job.id, payload, is_stream)
            .await
        {
            Ok(()) => tracing::debug!(job_id = %job.id, "Results sent"),
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "Failed to return job result")
            }
        }
    }

    /// Post one stream partial. Single attempt; failures are logged.
    pub async fn stream_result(&self, job: &Job, fragment: &StreamFragment) {
        let payload = fragment.to_wire().to_string();

        let url = match &self.endpoints.job_stream_url {
            Some(url) => url.clone(),
            None => {
                tracing::warn!(job_id = %job.id, result = %payload, "Local test stream results");
                return;
            }
        };

        if let Err(err) = self.transmit(&url, &job.id, payload, true).await {
            tracing::error!(job_id = %job.id, error = %err, "Failed to send stream partial");
        }
    }

    /// Post a progress update over the result endpoint. Best effort.
    pub async fn send_progress(&self, update: &ProgressUpdate) -> Result<()> {
        let url = self
            .endpoints
            .job_done_url
            .as_ref()
            .ok_or(WorkerError::MissingEndpoint("RUNPOD_WEBHOOK_POST_OUTPUT"))?;

        self.transmit(url, &update.job_id, update.to_wire().to_string(), false)
            .await
    }

    async fn transmit_with_retry(
        &self,
        url: &str,
        job_id: &str,
        payload: String,
        is_stream: bool,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.transmit(url, job_id, payload.clone(), is_stream).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < RESULT_MAX_ATTEMPTS => {
                    let delay = fibonacci_delay(attempt);
                    tracing::warn!(
                        job_id = %job_id,
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "Result POST failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn transmit(
        &self,
        url: &str,
        job_id: &str,
        payload: String,
        is_stream: bool,
    ) -> Result<()> {
        let response = self
            .client
            .post(url)
            .query(&[
                ("id", job_id),
                ("isStream", if is_stream { "true" } else { "false" }),
            ])
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}
