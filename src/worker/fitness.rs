//! Startup fitness checks.
//!
//! Fitness checks validate the worker environment before the main loop
//! starts: model files present, devices reachable, credentials valid. Any
//! failure aborts startup so the supervisor can restart or mark the worker
//! unhealthy. Checks never run in local test mode.

use futures::future::BoxFuture;
use futures::Future;

use crate::error::{Result, WorkerError};
use crate::worker::handler::BoxError;

type CheckOutput = std::result::Result<(), BoxError>;

enum CheckFn {
    Sync(Box<dyn Fn() -> CheckOutput + Send + Sync>),
    Async(Box<dyn Fn() -> BoxFuture<'static, CheckOutput> + Send + Sync>),
}

/// A named startup precondition, blocking or async.
pub struct FitnessCheck {
    name: String,
    check: CheckFn,
}

impl FitnessCheck {
    pub fn sync<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> CheckOutput + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: CheckFn::Sync(Box::new(check)),
        }
    }

    pub fn async_fn<F, Fut>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CheckOutput> + Send + 'static,
    {
        Self {
            name: name.into(),
            check: CheckFn::Async(Box::new(move || Box::pin(check()))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> CheckOutput {
        match &self.check {
            CheckFn::Sync(f) => f(),
            CheckFn::Async(f) => f().await,
        }
    }
}

impl std::fmt::Debug for FitnessCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitnessCheck").field("name", &self.name).finish()
    }
}

/// Run every check in registration order, failing fast on the first error.
pub async fn run_fitness_checks(checks: &[FitnessCheck]) -> Result<()> {
    if checks.is_empty() {
        tracing::debug!("No fitness checks registered, skipping");
        return Ok(());
    }

    tracing::info!(count = checks.len(), "Running fitness checks");

    for check in checks {
        tracing::debug!(name = check.name(), "Executing fitness check");
        if let Err(err) = check.run().await {
            tracing::error!(name = check.name(), error = %err, "Fitness check failed");
            return Err(WorkerError::FitnessCheck {
                name: check.name().to_string(),
                message: err.to_string(),
            });
        }
        tracing::debug!(name = check.name(), "Fitness check passed");
    }

    tracing::info!("All fitness checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_checks_run_in_registration_order() {
        let order = Arc::new(AtomicUsize::new(0));

        let o1 = order.clone();
        let o2 = order.clone();
        let checks = vec![
            FitnessCheck::sync("first", move || {
                assert_eq!(o1.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            }),
            FitnessCheck::async_fn("second", move || {
                let o2 = o2.clone();
                async move {
                    assert_eq!(o2.fetch_add(1, Ordering::SeqCst), 1);
                    Ok(())
                }
            }),
        ];

        run_fitness_checks(&checks).await.unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_checks() {
        let ran_second = Arc::new(AtomicUsize::new(0));
        let counter = ran_second.clone();

        let checks = vec![
            FitnessCheck::sync("broken", || Err("device missing".into())),
            FitnessCheck::sync("unreached", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let err = run_fitness_checks(&checks).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(err.to_string().contains("device missing"));
        assert_eq!(ran_second.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_registry_passes() {
        run_fitness_checks(&[]).await.unwrap();
    }
}
