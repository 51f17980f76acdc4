//! Bounded, retrying execution of remote operations
//!
//! A single semaphore caps the number of requests in flight across listing,
//! transfer and delete work, no matter how many files a sync discovers.
//! Failed attempts release their permit while waiting out the retry delay.

use crate::config::ClientConfig;
use crate::core::CancelFlag;
use crate::error::{Result, SyncError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Runs remote operations under a global concurrency cap with retry
#[derive(Debug, Clone)]
pub struct BoundedRetryExecutor {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    policy: RetryPolicy,
}

impl BoundedRetryExecutor {
    /// Create an executor allowing `max_concurrent` requests in flight
    pub fn new(max_concurrent: usize, policy: RetryPolicy) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            policy,
        }
    }

    /// Create an executor from client settings
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.max_concurrent_requests,
            RetryPolicy::new(config.retry_attempts, config.retry_delay),
        )
    }

    /// Configured concurrency cap
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits currently free
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Retry policy in use
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Wait for a request slot
    pub async fn acquire(&self) -> Result<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Run `op` under a permit, retrying recoverable failures
    ///
    /// Cancellation is checked before every attempt, and a result that
    /// arrives after cancellation is discarded. Errors that are not
    /// recoverable are returned immediately.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancelFlag,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            cancel.check()?;
            let result = {
                let _permit = self.acquire().await?;
                cancel.check()?;
                op().await
            };
            cancel.check()?;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() && attempt < self.policy.max_attempts => {
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        operation,
                        attempt,
                        self.policy.max_attempts,
                        e,
                        self.policy.delay
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(e) => {
                    if attempt > 1 {
                        tracing::debug!("{} gave up after {} attempts", operation, attempt);
                    }
                    return Err(e);
                }
            }
        }
    }
}
