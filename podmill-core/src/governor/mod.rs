//! Named permit pools and the retry policy shared by every external call.
//!
//! Distinct pools are independent: saturating disk-bound work never blocks a
//! database write. CPU-bound budgets come from the detected core count, not a
//! hard-coded constant.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{GovernorConfig, RetryConfig};
use crate::error::{PipelineError, Result};

/// Named pools of scarce local resources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// Disk-bound subprocess work: downloads, merges, transcodes.
    Disk,
    /// Outbound network calls: uploads, thumbnail fetches.
    Network,
    /// Database writes.
    Database,
}

impl Resource {
    fn name(self) -> &'static str {
        match self {
            Resource::Disk => "disk",
            Resource::Network => "network",
            Resource::Database => "database",
        }
    }
}

/// Counting semaphores per resource plus the shared retry policy.
#[derive(Clone, Debug)]
pub struct ResourceGovernor {
    disk: Arc<Semaphore>,
    network: Arc<Semaphore>,
    database: Arc<Semaphore>,
    retry: RetryConfig,
}

impl ResourceGovernor {
    pub fn new(config: &GovernorConfig, retry: RetryConfig) -> Self {
        Self {
            disk: Arc::new(Semaphore::new(config.disk_permits.max(1))),
            network: Arc::new(Semaphore::new(config.network_permits.max(1))),
            database: Arc::new(Semaphore::new(config.database_permits.max(1))),
            retry,
        }
    }

    /// Usable CPU cores on this host, the budget for CPU-bound work.
    pub fn cpu_bound_permits() -> usize {
        num_cpus::get().max(1)
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn pool(&self, resource: Resource) -> &Semaphore {
        match resource {
            Resource::Disk => &self.disk,
            Resource::Network => &self.network,
            Resource::Database => &self.database,
        }
    }

    /// Run `work` once a permit for `resource` is free. The permit is returned
    /// when the future settles, success or failure.
    pub async fn run_with_permit<T, F>(&self, resource: Resource, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .pool(resource)
            .acquire()
            .await
            .map_err(|_| PipelineError::Internal(format!("{} pool closed", resource.name())))?;
        debug!(resource = resource.name(), "permit acquired");
        work.await
    }

    /// Retry `op` with exponential, jittered backoff until it succeeds, fails
    /// with a non-retryable error, or exhausts the attempt budget. The final
    /// error is wrapped with `stage` so operators can tell which part of the
    /// pipeline gave up.
    pub async fn retry_with_backoff<T, F, Fut>(&self, stage: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        stage,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.into_stage(stage)),
            }
        }
    }

    /// Permit + retry in one call: each attempt re-acquires the permit, so a
    /// long backoff sleep never starves other holders of the pool.
    pub async fn execute<T, F, Fut>(
        &self,
        resource: Resource,
        stage: &'static str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_with_backoff(stage, || self.run_with_permit(resource, op()))
            .await
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exp = attempt.saturating_sub(1) as i32;
        let scaled = (self.retry.base_delay_ms as f64) * self.retry.multiplier.powi(exp);
        let capped = scaled.min(self.retry.max_delay_ms as f64);
        capped.max(0.0) as u64
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }

        let upper_cap = self.retry.max_delay_ms.max(1);
        let capped = base.min(upper_cap);
        let spread = (capped as f64 * 0.25).max(1.0);
        let lower = (capped as f64 - spread).max(1.0);
        let upper = (capped as f64 + spread).min(upper_cap as f64);

        let mut rng = rand::rng();
        let ms = rng.random_range(lower..=upper).round() as u64;
        Duration::from_millis(ms)
    }
}
