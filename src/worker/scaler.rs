//! Concurrency scaling and the two main loops.
//!
//! The scaler owns the shutdown signal, the bounded queue and the
//! concurrency budget. The fetch loop keeps the queue topped up from the
//! acquisition endpoint; the run loop drains it into concurrent tasks
//! capped by the budget. Both observe the shutdown token at every
//! suspension point, and the run loop only exits once the queue and the
//! in-flight set are empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::job::{Job, JobQueue};
use crate::registry::JobRegistry;
use crate::transport::Transport;
use crate::worker::handler::{run_job, run_stream_job};

const CAPACITY_POLL: Duration = Duration::from_secs(1);
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(5);
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    FitnessOk,
    Running,
    Resizing,
    Draining,
    Stopped,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::FitnessOk => write!(f, "fitness_ok"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Resizing => write!(f, "resizing"),
            WorkerState::Draining => write!(f, "draining"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct JobScaler {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    transport: Arc<Transport>,
    shutdown: CancellationToken,
    concurrency: AtomicUsize,
    state: Mutex<WorkerState>,
}

impl JobScaler {
    pub fn new(
        config: WorkerConfig,
        transport: Arc<Transport>,
        registry: Arc<JobRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue: Arc::new(JobQueue::new(1)),
            registry,
            transport,
            shutdown,
            concurrency: AtomicUsize::new(1),
            state: Mutex::new(WorkerState::Starting),
        }
    }

    pub fn current_concurrency(&self) -> usize {
        self.concurrency.load(Ordering::Relaxed)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn state(&self) -> WorkerState {
        *self.state.lock().await
    }

    async fn set_state(&self, next: WorkerState) {
        let mut state = self.state.lock().await;
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "Worker state changed");
            *state = next;
        }
    }

    /// Run the fetch and run loops to completion. Returns once shutdown has
    /// been signalled and every queued and in-flight job has reached a
    /// terminal result attempt.
    pub async fn run(self: Arc<Self>) {
        // Fitness checks passed before the scaler was built.
        self.set_state(WorkerState::FitnessOk).await;
        self.set_state(WorkerState::Running).await;

        let fetcher = self.clone();
        let runner = self.clone();
        tokio::join!(fetcher.fetch_loop(), runner.run_loop());

        self.set_state(WorkerState::Stopped).await;
    }

    /// Sleep that wakes early on shutdown.
    async fn idle_wait(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Apply the user-supplied concurrency modifier. A change waits for the
    /// queued portion to drain (in-flight tasks keep running), then swaps
    /// the queue capacity so the new bound is observed atomically.
    async fn apply_concurrency_modifier(&self) {
        let current = self.concurrency.load(Ordering::Relaxed);
        let desired = match &self.config.concurrency_modifier {
            Some(modifier) => modifier(current).max(1),
            None => current,
        };

        if desired == current {
            return;
        }

        self.set_state(WorkerState::Resizing).await;
        tracing::info!(current, desired, "Adjusting concurrency");

        while !self.queue.is_empty().await && !self.shutdown.is_cancelled() {
            self.idle_wait(CAPACITY_POLL).await;
        }

        self.queue.set_capacity(desired).await;
        self.concurrency.store(desired, Ordering::Relaxed);
        self.set_state(WorkerState::Running).await;
    }

    /// Acquisition loop: poll the job-take endpoint whenever the queue has
    /// free capacity, and push what comes back.
    async fn fetch_loop(self: Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            eprintln!("DEBUG t={:?} fetch_loop TOP", std::time::Instant::now());
            self.apply_concurrency_modifier().await;
            eprintln!("DEBUG t={:?} fetch_loop after apply_concurrency_modifier", std::time::Instant::now());

            let budget = self.concurrency.load(Ordering::Relaxed);
            let queued = self.queue.len().await;
            eprintln!("DEBUG t={:?} fetch_loop after queue.len", std::time::Instant::now());
            if queued >= budget {
                tracing::debug!(queued, budget, "Queue is full, retrying soon");
                self.idle_wait(CAPACITY_POLL).await;
                continue;
            }

            let jobs_needed = budget - queued;
            let jobs_in_progress = self.registry.count().await > 0;
            eprintln!("DEBUG t={:?} fetch_loop: queued={} budget={} jobs_in_progress={}", std::time::Instant::now(), queued, budget, jobs_in_progress);

            let get_result = self.transport.get_jobs(jobs_needed, jobs_in_progress).await;
            eprintln!("DEBUG t={:?} get_jobs result: {:?}", std::time::Instant::now(), get_result.as_ref().map(|v| v.len()));
            match get_result {
                Ok(jobs) if jobs.is_empty() => {
                    tracing::debug!("No jobs acquired");
                }
                Ok(jobs) => {
                    for job in jobs {
                        self.enqueue(job).await;
                    }
                    let queued = self.queue.len().await;
                    tracing::info!(queued, "Jobs in queue");
                }
                Err(WorkerError::RateLimited) => {
                    tracing::debug!(
                        backoff_secs = RATE_LIMIT_BACKOFF.as_secs(),
                        "Rate limited, backing off"
                    );
                    self.idle_wait(RATE_LIMIT_BACKOFF).await;
                }
                Err(WorkerError::Http(err)) if err.is_timeout() => {
                    tracing::debug!("Acquisition timed out");
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to get jobs");
                    self.idle_wait(ACQUIRE_RETRY_DELAY).await;
                }
            }
        }

        // No further acquisitions; let the run loop drain what remains.
        self.set_state(WorkerState::Draining).await;
        self.queue.close().await;
        tracing::info!("Job acquisition stopped, draining");
    }

    /// Queue push is the linearization point at which this worker takes
    /// responsibility for the job; the registry add follows it. Duplicates
    /// of a job still queued or in flight are dropped.
    async fn enqueue(&self, job: Job) {
        if self.registry.contains(&job.id).await || self.queue.contains(&job.id).await {
            tracing::warn!(job_id = %job.id, "Duplicate job dropped");
            return;
        }

        let id = job.id.clone();
        if !self.queue.push(job).await {
            tracing::warn!(job_id = %id, "Queue closed, job dropped");
            return;
        }

        let add_result = self.registry.add(&id).await;
        eprintln!("DEBUG t={:?} enqueue add_result={:?} count_after={}", std::time::Instant::now(), add_result.is_ok(), self.registry.count().await);
        if let Err(err) = add_result {
            tracing::error!(job_id = %id, error = %err, "Failed to record job in registry");
        }
    }

    /// Dispatch loop: pop queued jobs into concurrent tasks, capped at the
    /// budget, reacting as soon as any task finishes.
    async fn run_loop(self: Arc<Self>) {
        let mut in_flight: FuturesUnordered<JoinHandle<String>> = FuturesUnordered::new();
        let mut draining = false;

        loop {
            if draining && in_flight.is_empty() {
                break;
            }

            let budget = self.concurrency.load(Ordering::Relaxed);

            tokio::select! {
                Some(finished) = in_flight.next(), if !in_flight.is_empty() => {
                    match finished {
                        Ok(job_id) => {
                            tracing::debug!(job_id = %job_id, in_flight = in_flight.len(), "Job task finished");
                        }
                        Err(err) => {
                            // The registry entry stays behind, so the
                            // control plane will re-dispatch after its
                            // acquisition timeout.
                            tracing::error!(error = %err, "Job task aborted");
                        }
                    }
                }
                maybe_job = self.queue.pop(), if !draining && in_flight.len() < budget => {
                    match maybe_job {
                        Some(job) => {
                            tracing::info!(
                                job_id = %job.id,
                                in_flight = in_flight.len() + 1,
                                "Jobs in progress"
                            );
                            let scaler = self.clone();
                            in_flight.push(tokio::spawn(async move {
                                let job_id = job.id.clone();
                                scaler.process_job(job).await;
                                job_id
                            }));
                        }
                        None => draining = true,
                    }
                }
                else => break,
            }
        }
    }

    /// Handle one job end to end: invoke the handler, post the terminal
    /// result, then release the registry entry. The entry is removed even
    /// when delivery failed; the control plane re-dispatches on its own
    /// timeout, which preserves at-least-once.
    async fn process_job(&self, job: Job) {
        eprintln!("DEBUG t={:?} process_job START {}", std::time::Instant::now(), job.id);
        let is_stream = self.config.handler.is_stream();
        let endpoints = self.transport.endpoints();
        let started = std::time::Instant::now();

        let mut result = if is_stream {
            run_stream_job(
                &self.config.handler,
                &job,
                endpoints,
                &self.transport,
                self.config.return_aggregate_stream,
                self.config.max_output_bytes,
            )
            .await
        } else {
            run_job(&self.config.handler, &job, endpoints, self.config.max_output_bytes).await
        };

        if self.config.rp_args.rp_debugger {
            attach_debugger_output(&mut result, started.elapsed());
        }

        let result = result.with_refresh(self.config.refresh_worker);
        if result.refresh_worker {
            tracing::info!(job_id = %job.id, "refresh_worker set, stopping worker after job");
        }

        self.transport.send_result(&job, &result, is_stream).await;

        eprintln!("DEBUG t={:?} process_job REMOVE {}", std::time::Instant::now(), job.id);
        if let Err(err) = self.registry.remove(&job.id).await {
            tracing::error!(job_id = %job.id, error = %err, "Failed to remove job from registry");
        }

        if result.refresh_worker {
            self.shutdown.cancel();
        }
    }
}

/// Fold handler timing into a successful object output when the debugger
/// flag is set.
fn attach_debugger_output(result: &mut crate::job::JobResult, elapsed: Duration) {
    if let crate::job::JobOutcome::Success {
        output: serde_json::Value::Object(map),
    } = &mut result.outcome
    {
        map.insert(
            "rp_debugger".to_string(),
            serde_json::json!({ "handler_duration_ms": elapsed.as_millis() as u64 }),
        );
    }
}
