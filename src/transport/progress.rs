//! Handler-visible progress updates.
//!
//! Updates are pushed into a bounded channel and forwarded by one
//! long-lived task over the shared connection pool. The handler-facing
//! function only enqueues and returns; it never blocks on the network.

use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::ProgressUpdate;
use crate::transport::Transport;

const PROGRESS_QUEUE_DEPTH: usize = 64;

static PROGRESS_TX: OnceLock<mpsc::Sender<ProgressUpdate>> = OnceLock::new();

/// Wire up the progress channel and spawn its forwarding task. Called once
/// by the worker at startup; later calls are no-ops.
pub(crate) fn spawn_progress_forwarder(transport: Arc<Transport>) {
    let (tx, mut rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_QUEUE_DEPTH);
    if PROGRESS_TX.set(tx).is_err() {
        return;
    }

    tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            tracing::debug!(job_id = %update.job_id, "Sending progress update");
            if let Err(err) = transport.send_progress(&update).await {
                tracing::warn!(job_id = %update.job_id, error = %err, "Progress update failed");
            }
        }
    });
}

/// Report progress for a running job. Best effort: returns `false` when the
/// update was dropped (channel full, or worker not in serving mode).
pub fn progress_update(job_id: &str, payload: Value) -> bool {
    let Some(tx) = PROGRESS_TX.get() else {
        tracing::debug!(job_id = %job_id, "Progress channel not running, update dropped");
        return false;
    };

    let update = ProgressUpdate {
        job_id: job_id.to_string(),
        payload,
    };
    match tx.try_send(update) {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(job_id = %job_id, error = %err, "Progress update dropped");
            false
        }
    }
}
