use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use uuid::Uuid;

use crate::worker::fitness::FitnessCheck;
use crate::worker::handler::Handler;

/// Default ceiling on a terminal output body before it is replaced with an
/// error pointing the user at object storage.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 20 * 1024 * 1024;

/// Default path of the in-progress job registry, relative to the working
/// directory. The companion lock file lives next to it.
pub const DEFAULT_REGISTRY_FILE: &str = ".runpod_jobs.json";

const DEFAULT_PING_INTERVAL_SECS: u64 = 10;

/// User-supplied function that maps the current concurrency budget to a new
/// one. Consulted before every fetch cycle.
pub type ConcurrencyModifier = Arc<dyn Fn(usize) -> usize + Send + Sync>;

/// Runtime arguments recognized by the worker binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "runpod-worker")]
#[command(about = "RunPod serverless worker runtime arguments")]
pub struct RpArgs {
    /// Console log level: ERROR, WARNING, INFO or DEBUG
    #[arg(long)]
    pub rp_log_level: Option<String>,

    /// Include debugger timing output in job results
    #[arg(long, default_value_t = false)]
    pub rp_debugger: bool,

    /// Run once against the given JSON job and exit
    #[arg(long)]
    pub test_input: Option<String>,

    /// Serve the local development API instead of polling for jobs
    #[arg(long, default_value_t = false)]
    pub rp_serve_api: bool,

    /// Host for the local development API
    #[arg(long, default_value = "localhost")]
    pub rp_api_host: String,

    /// Port for the local development API
    #[arg(long, default_value_t = 8000)]
    pub rp_api_port: u16,
}

impl Default for RpArgs {
    fn default() -> Self {
        Self {
            rp_log_level: None,
            rp_debugger: false,
            test_input: None,
            rp_serve_api: false,
            rp_api_host: "localhost".to_string(),
            rp_api_port: 8000,
        }
    }
}

/// Worker configuration. Only the handler is required; everything else has
/// a usable default.
pub struct WorkerConfig {
    pub handler: Handler,
    pub concurrency_modifier: Option<ConcurrencyModifier>,
    pub refresh_worker: bool,
    pub return_aggregate_stream: bool,
    pub max_output_bytes: usize,
    pub registry_path: PathBuf,
    pub fitness_checks: Vec<FitnessCheck>,
    pub rp_args: RpArgs,
}

impl WorkerConfig {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            concurrency_modifier: None,
            refresh_worker: false,
            return_aggregate_stream: false,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            registry_path: PathBuf::from(DEFAULT_REGISTRY_FILE),
            fitness_checks: Vec::new(),
            rp_args: RpArgs::default(),
        }
    }

    pub fn with_concurrency_modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        self.concurrency_modifier = Some(Arc::new(modifier));
        self
    }

    /// Exit cleanly after the current job completes so the supervisor
    /// restarts the worker with a fresh environment.
    pub fn with_refresh_worker(mut self, refresh: bool) -> Self {
        self.refresh_worker = refresh;
        self
    }

    /// Aggregate stream partials into the terminal result instead of
    /// finishing with an empty output.
    pub fn with_return_aggregate_stream(mut self, aggregate: bool) -> Self {
        self.return_aggregate_stream = aggregate;
        self
    }

    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub fn with_registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_path = path.into();
        self
    }

    pub fn with_fitness_check(mut self, check: FitnessCheck) -> Self {
        self.fitness_checks.push(check);
        self
    }
}

/// Control-plane endpoints and worker identity, resolved from the
/// environment once at startup.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub job_take_url: Option<String>,
    pub job_done_url: Option<String>,
    pub job_stream_url: Option<String>,
    pub ping_url: Option<String>,
    pub ping_interval: Duration,
    pub worker_id: String,
    pub hostname: String,
}

impl Endpoints {
    pub fn from_env() -> Self {
        let worker_id =
            std::env::var("RUNPOD_POD_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let hostname =
            std::env::var("RUNPOD_POD_HOSTNAME").unwrap_or_else(|_| "unknown".to_string());

        let ping_interval = std::env::var("RUNPOD_PING_INTERVAL")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS));

        let resolve = |name: &str| {
            std::env::var(name).ok().map(|url| {
                url.replace("$RUNPOD_POD_ID", &worker_id)
                    .replace("$ID", &worker_id)
            })
        };

        Self {
            job_take_url: resolve("RUNPOD_WEBHOOK_GET_JOB"),
            job_done_url: resolve("RUNPOD_WEBHOOK_POST_OUTPUT"),
            job_stream_url: resolve("RUNPOD_WEBHOOK_POST_STREAM"),
            ping_url: resolve("RUNPOD_WEBHOOK_PING"),
            ping_interval,
            worker_id,
            hostname,
        }
    }

    /// The presence of the acquisition endpoint switches the worker into
    /// serving mode; without it the worker runs locally.
    pub fn serving_mode(&self) -> bool {
        self.job_take_url.is_some()
    }
}

/// Inline-HTTP serving port, if requested through the environment.
pub fn realtime_port() -> Option<u16> {
    std::env::var("RUNPOD_REALTIME_PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .filter(|port| *port > 0)
}

pub fn realtime_concurrency() -> usize {
    std::env::var("RUNPOD_REALTIME_CONCURRENCY")
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(1)
}

/// Log directive for the tracing subscriber. The CLI flag wins over
/// `RUNPOD_DEBUG_LEVEL`; both fall back to `info`.
pub fn log_directive(args: &RpArgs) -> String {
    let level = args
        .rp_log_level
        .clone()
        .or_else(|| std::env::var("RUNPOD_DEBUG_LEVEL").ok())
        .unwrap_or_else(|| "INFO".to_string());

    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARN" | "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directive_maps_levels() {
        let mut args = RpArgs::default();
        args.rp_log_level = Some("WARNING".to_string());
        assert_eq!(log_directive(&args), "warn");

        args.rp_log_level = Some("debug".to_string());
        assert_eq!(log_directive(&args), "debug");

        args.rp_log_level = Some("bogus".to_string());
        assert_eq!(log_directive(&args), "info");
    }

    #[test]
    fn test_worker_config_defaults() {
        let config = WorkerConfig::new(Handler::sync(|job| Ok(job.input)));
        assert!(!config.refresh_worker);
        assert!(!config.return_aggregate_stream);
        assert_eq!(config.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(config.registry_path, PathBuf::from(DEFAULT_REGISTRY_FILE));
        assert!(config.fitness_checks.is_empty());
    }
}
