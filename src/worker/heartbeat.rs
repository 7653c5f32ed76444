//! Worker liveness heartbeat.
//!
//! The heartbeat runs on its own OS thread with a dedicated single-thread
//! runtime, so a blocking handler stalling the main scheduler cannot starve
//! it. Every tick it re-reads the registry file (never the in-process set,
//! whose lock a handler's task could be contending) and reports the
//! in-progress job ids to the ping endpoint.

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Endpoints;
use crate::registry::JobRegistry;

pub struct Heartbeat {
    ping_url: Option<String>,
    interval: Duration,
    registry_path: PathBuf,
}

/// Handle to a running heartbeat thread. Dropping it cancels the loop;
/// [`stop`](HeartbeatHandle::stop) also joins the thread.
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn stop(mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Heartbeat {
    pub fn new(endpoints: &Endpoints, registry_path: PathBuf) -> Self {
        Self {
            ping_url: endpoints.ping_url.clone(),
            interval: endpoints.ping_interval,
            registry_path,
        }
    }

    /// Spawn the heartbeat thread. When no ping URL is configured (local
    /// runs) the returned handle is inert.
    pub fn start(self) -> HeartbeatHandle {
        let cancel = CancellationToken::new();

        if self.ping_url.is_none() {
            tracing::info!("Ping URL not set, heartbeat disabled");
            return HeartbeatHandle {
                cancel,
                thread: None,
            };
        }

        let loop_cancel = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to build heartbeat runtime");
                        return;
                    }
                };
                runtime.block_on(self.ping_loop(loop_cancel));
            });

        let thread = match spawned {
            Ok(thread) => Some(thread),
            Err(err) => {
                tracing::error!(error = %err, "Failed to spawn heartbeat thread");
                None
            }
        };

        HeartbeatHandle { cancel, thread }
    }

    async fn ping_loop(self, cancel: CancellationToken) {
        // self.ping_url checked by start()
        let Some(ping_url) = self.ping_url.clone() else {
            return;
        };

        let client = match reqwest::Client::builder().build() {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(error = %err, "Failed to build heartbeat HTTP client");
                return;
            }
        };

        tracing::debug!(
            interval_secs = self.interval.as_secs(),
            url = %ping_url,
            "Heartbeat started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        let mut retry_ping = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let job_ids = match JobRegistry::read_ids(&self.registry_path) {
                Ok(ids) => ids,
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to read registry for heartbeat");
                    Vec::new()
                }
            };

            match self.send_ping(&client, &ping_url, &job_ids, retry_ping).await {
                Ok(status) => {
                    tracing::debug!(status, jobs = job_ids.len(), "Heartbeat sent");
                    retry_ping = false;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Heartbeat failed");
                    retry_ping = true;
                }
            }
        }

        tracing::debug!("Heartbeat stopped");
    }

    async fn send_ping(
        &self,
        client: &reqwest::Client,
        url: &str,
        job_ids: &[String],
        retry_ping: bool,
    ) -> Result<u16, reqwest::Error> {
        let mut params = vec![
            ("job_id", job_ids.join(",")),
            ("runpod_version", crate::VERSION.to_string()),
        ];
        if retry_ping {
            params.push(("retry_ping", "1".to_string()));
        }

        let response = client
            .get(url)
            .query(&params)
            .timeout(self.interval * 2)
            .send()
            .await?;

        let status = response.status();
        response.error_for_status()?;
        Ok(status.as_u16())
    }
}
