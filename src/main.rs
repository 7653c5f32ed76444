//! Echo worker binary, used to smoke-test the runtime.
//!
//! Returns each job's input as its output. Run one job locally with:
//!
//! ```text
//! runpod-worker --test_input '{"input": {"hello": "world"}}'
//! ```

use runpod_worker::config::WorkerConfig;
use runpod_worker::worker::{self, Handler};

fn main() {
    let handler = Handler::sync(|job| Ok(job.input));
    worker::start(WorkerConfig::new(handler));
}
