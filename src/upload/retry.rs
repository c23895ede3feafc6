//! Bounded retry for remote calls
//!
//! Only timeouts are retried. A rejection or an unreadable response fails
//! the call immediately. The budget is owned by the caller (one per block,
//! one for assembly) and refilled after every successful call, so a block
//! only fails after `max_attempts` consecutive timeouts.

use super::{BlockRef, Stage, UploadError};
use crate::config::UploadConfig;
use crate::metrics;
use crate::wcs::TransportError;
use std::future::Future;
use std::time::Duration;

/// Retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_attempts, config.retry_backoff())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Call `op` until it succeeds, fails for good, or `budget` runs out.
    ///
    /// Every attempt repeats the identical call. On success the budget is
    /// refilled to `max_attempts`.
    pub async fn run<T, F, Fut>(
        &self,
        budget: &mut u32,
        stage: Stage,
        block: Option<u32>,
        mut op: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        if *budget == 0 {
            *budget = self.max_attempts;
        }

        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match op().await {
                Ok(value) => {
                    *budget = self.max_attempts;
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    *budget -= 1;

                    if *budget == 0 {
                        tracing::warn!(
                            stage = %stage,
                            block = %BlockRef(block),
                            attempts,
                            "Giving up after repeated timeouts"
                        );
                        return Err(UploadError::RetryExhausted {
                            stage,
                            block: BlockRef(block),
                            attempts,
                        });
                    }

                    tracing::warn!(
                        stage = %stage,
                        block = %BlockRef(block),
                        remaining = *budget,
                        error = %e,
                        "Remote call timed out, retrying"
                    );
                    metrics::record_retry(stage.as_str());

                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(e) => return Err(UploadError::from_transport(stage, block, e)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}
