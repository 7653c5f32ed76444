use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Rate limited by the job acquisition endpoint")]
    RateLimited,

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Malformed job payload: {0}")]
    MalformedJob(String),

    #[error("Endpoint not configured: {0}")]
    MissingEndpoint(&'static str),

    #[error("Fitness check '{name}' failed: {message}")]
    FitnessCheck { name: String, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
